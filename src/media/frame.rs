// SPDX-License-Identifier: GPL-3.0-only

//! Borrowed view over one captured frame
//!
//! A [`FrameBuffer`] borrows the planes of an acquired image, so it cannot
//! outlive the acquisition: once the image is handed back to the reader the
//! borrow checker rejects any further use of the view.

use super::converter;
use crate::backends::camera::types::{ChromaOrder, FrameFormat, PreviewSize, RawImage};
use crate::errors::FrameError;
use image::{GrayImage, RgbaImage};
use std::cell::OnceCell;

/// One plane of sample rows
#[derive(Debug, Clone, Copy)]
pub struct PlaneView<'a> {
    data: &'a [u8],
    row_stride: usize,
}

impl<'a> PlaneView<'a> {
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    /// Bytes of row `index` starting at its first sample, `len` bytes long
    #[inline]
    pub fn row(&self, index: usize, len: usize) -> &'a [u8] {
        let start = index * self.row_stride;
        &self.data[start..start + len]
    }
}

/// Validated chroma layout of a frame, one variant per [`FrameFormat`]
#[derive(Debug, Clone, Copy)]
pub(crate) enum FrameLayout<'a> {
    /// Interleaved V,U pairs following the luma rows
    Nv21 { vu: PlaneView<'a> },
    /// Quarter-size planes, read in I420 order
    Yv12 { u: PlaneView<'a>, v: PlaneView<'a> },
    /// Separate interleaved chroma plane
    TwoPlane {
        chroma: PlaneView<'a>,
        order: ChromaOrder,
    },
}

/// Single-channel view of the luma plane, no copy involved
#[derive(Debug, Clone, Copy)]
pub struct GrayView<'a> {
    plane: PlaneView<'a>,
    width: u32,
    height: u32,
}

impl<'a> GrayView<'a> {
    pub(crate) fn new(plane: PlaneView<'a>, width: u32, height: u32) -> Self {
        Self {
            plane,
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn row_stride(&self) -> usize {
        self.plane.row_stride
    }

    /// Row `y` without stride padding
    ///
    /// # Panics
    ///
    /// Panics if `y` is not below the view height.
    pub fn row(&self, y: u32) -> &'a [u8] {
        assert!(y < self.height, "row {} out of range for height {}", y, self.height);
        self.plane.row(y as usize, self.width as usize)
    }

    /// Sample at `(x, y)`, `None` outside the view
    pub fn get(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.row(y)[x as usize])
    }

    pub fn rows(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.height).map(move |y| self.row(y))
    }

    /// Copy into an owned image, dropping stride padding
    pub fn to_image(&self) -> GrayImage {
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize);
        for row in self.rows() {
            out.extend_from_slice(row);
        }
        GrayImage::from_raw(self.width, self.height, out)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }
}

/// A captured frame, borrowed for the duration of one consumer callback
pub struct FrameBuffer<'a> {
    width: u32,
    height: u32,
    format: FrameFormat,
    sequence: u64,
    luma: PlaneView<'a>,
    layout: FrameLayout<'a>,
    color: OnceCell<RgbaImage>,
}

impl<'a> FrameBuffer<'a> {
    /// Build a view over an acquired image, validating its plane layout
    pub fn from_image(image: &'a RawImage) -> Result<Self, FrameError> {
        let (width, height) = (image.width, image.height);
        check_dimensions(width, height)?;
        let (w, h) = (width as usize, height as usize);

        let (luma, layout) = match image.format {
            FrameFormat::Nv21 => {
                let plane = first_plane(image)?;
                let stride = plane.row_stride;
                check_stride("luma", stride, w)?;

                let luma_len = h * stride;
                let chroma_len = span(h / 2, stride, w);
                check_len("buffer", plane.data.len(), luma_len + chroma_len)?;

                let data = plane.data.as_slice();
                (
                    PlaneView {
                        data: &data[..luma_len],
                        row_stride: stride,
                    },
                    FrameLayout::Nv21 {
                        vu: PlaneView {
                            data: &data[luma_len..],
                            row_stride: stride,
                        },
                    },
                )
            }
            FrameFormat::Yv12 => {
                let plane = first_plane(image)?;
                let stride = plane.row_stride;
                check_stride("luma", stride, w)?;

                let chroma_stride = stride / 2;
                let luma_len = h * stride;
                let chroma_plane_len = (h / 2) * chroma_stride;
                check_len(
                    "buffer",
                    plane.data.len(),
                    luma_len + chroma_plane_len + span(h / 2, chroma_stride, w / 2),
                )?;

                let data = plane.data.as_slice();
                let second_start = luma_len + chroma_plane_len;
                (
                    PlaneView {
                        data: &data[..luma_len],
                        row_stride: stride,
                    },
                    // Legacy YV12 buffers decode correctly only when read in
                    // I420 plane order; reading V first swaps red and blue.
                    FrameLayout::Yv12 {
                        u: PlaneView {
                            data: &data[luma_len..second_start],
                            row_stride: chroma_stride,
                        },
                        v: PlaneView {
                            data: &data[second_start..],
                            row_stride: chroma_stride,
                        },
                    },
                )
            }
            FrameFormat::Yuv420TwoPlane { chroma: order } => {
                if image.planes.len() < 2 {
                    return Err(FrameError::InvalidLayout(format!(
                        "expected 2 planes, got {}",
                        image.planes.len()
                    )));
                }
                let y = &image.planes[0];
                let uv = &image.planes[1];
                if y.pixel_stride != 1 {
                    return Err(FrameError::UnsupportedFormat(format!(
                        "luma pixel stride {}",
                        y.pixel_stride
                    )));
                }
                if uv.pixel_stride != 2 {
                    return Err(FrameError::UnsupportedFormat(format!(
                        "chroma pixel stride {}",
                        uv.pixel_stride
                    )));
                }
                check_stride("luma", y.row_stride, w)?;
                check_stride("chroma", uv.row_stride, w)?;
                check_len("luma", y.data.len(), h * y.row_stride)?;
                check_len("chroma", uv.data.len(), span(h / 2, uv.row_stride, w))?;

                (
                    PlaneView {
                        data: &y.data,
                        row_stride: y.row_stride,
                    },
                    FrameLayout::TwoPlane {
                        chroma: PlaneView {
                            data: &uv.data,
                            row_stride: uv.row_stride,
                        },
                        order,
                    },
                )
            }
        };

        Ok(Self {
            width,
            height,
            format: image.format,
            sequence: image.sequence,
            luma,
            layout,
            color: OnceCell::new(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> PreviewSize {
        PreviewSize::new(self.width, self.height)
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn luma(&self) -> PlaneView<'a> {
        self.luma
    }

    /// Interleaved chroma plane, present for the semi-planar layouts
    pub fn chroma(&self) -> Option<PlaneView<'a>> {
        match self.layout {
            FrameLayout::Nv21 { vu } => Some(vu),
            FrameLayout::TwoPlane { chroma, .. } => Some(chroma),
            FrameLayout::Yv12 { .. } => None,
        }
    }

    pub(crate) fn layout(&self) -> FrameLayout<'a> {
        self.layout
    }

    /// Luma as a gray image view
    pub fn gray(&self) -> GrayView<'a> {
        converter::gray(self)
    }

    /// RGBA conversion, computed on first use and cached
    pub fn color(&self) -> &RgbaImage {
        self.color.get_or_init(|| converter::color(self))
    }

    /// The cached colour image, if something already asked for it
    pub fn cached_color(&self) -> Option<&RgbaImage> {
        self.color.get()
    }
}

impl std::fmt::Debug for FrameBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("color_cached", &self.color.get().is_some())
            .finish()
    }
}

/// Bytes needed for `rows` rows of `row_len` bytes at `stride`, last row unpadded
fn span(rows: usize, stride: usize, row_len: usize) -> usize {
    if rows == 0 {
        0
    } else {
        (rows - 1) * stride + row_len
    }
}

fn check_dimensions(width: u32, height: u32) -> Result<(), FrameError> {
    if width == 0 || height == 0 {
        return Err(FrameError::InvalidLayout(format!(
            "empty frame {}x{}",
            width, height
        )));
    }
    if width % 2 != 0 || height % 2 != 0 {
        return Err(FrameError::InvalidLayout(format!(
            "4:2:0 frame needs even dimensions, got {}x{}",
            width, height
        )));
    }
    Ok(())
}

fn first_plane(image: &RawImage) -> Result<&crate::backends::camera::types::Plane, FrameError> {
    image
        .planes
        .first()
        .ok_or_else(|| FrameError::InvalidLayout("no planes".to_string()))
}

fn check_stride(plane: &str, stride: usize, width: usize) -> Result<(), FrameError> {
    if stride < width {
        return Err(FrameError::InvalidLayout(format!(
            "{} stride {} below width {}",
            plane, stride, width
        )));
    }
    Ok(())
}

fn check_len(plane: &str, actual: usize, required: usize) -> Result<(), FrameError> {
    if actual < required {
        return Err(FrameError::InvalidLayout(format!(
            "{} plane holds {} bytes, needs {}",
            plane, actual, required
        )));
    }
    Ok(())
}
