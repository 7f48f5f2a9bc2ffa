// SPDX-License-Identifier: GPL-3.0-only

//! YUV 4:2:0 to RGBA conversion
//!
//! Each frame layout maps to exactly one conversion routine. Colour uses
//! full-range BT.601:
//!
//! ```text
//! R = Y + 1.402 (V - 128)
//! G = Y - 0.344 (U - 128) - 0.714 (V - 128)
//! B = Y + 1.772 (U - 128)
//! ```
//!
//! so neutral chroma leaves the luma value unchanged in all three channels.

use super::frame::{FrameBuffer, FrameLayout, GrayView, PlaneView};
use crate::backends::camera::types::ChromaOrder;
use image::RgbaImage;

/// Zero-copy gray view of the luma plane
pub fn gray<'a>(frame: &FrameBuffer<'a>) -> GrayView<'a> {
    GrayView::new(frame.luma(), frame.width(), frame.height())
}

/// Convert a frame to RGBA
///
/// Prefer [`FrameBuffer::color`], which caches the result.
pub fn color(frame: &FrameBuffer<'_>) -> RgbaImage {
    let mut out = RgbaImage::new(frame.width(), frame.height());
    let rgba: &mut [u8] = &mut out;

    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let luma = frame.luma();

    match frame.layout() {
        FrameLayout::Nv21 { vu } => {
            semi_planar_to_rgba(luma, vu, ChromaOrder::Vu, width, height, rgba)
        }
        FrameLayout::Yv12 { u, v } => planar_to_rgba(luma, u, v, width, height, rgba),
        FrameLayout::TwoPlane { chroma, order } => {
            semi_planar_to_rgba(luma, chroma, order, width, height, rgba)
        }
    }

    out
}

#[inline]
fn yuv_to_rgba(y: u8, u: u8, v: u8, out: &mut [u8]) {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    out[0] = (y + 1.402 * v).round().clamp(0.0, 255.0) as u8;
    out[1] = (y - 0.344 * u - 0.714 * v).round().clamp(0.0, 255.0) as u8;
    out[2] = (y + 1.772 * u).round().clamp(0.0, 255.0) as u8;
    out[3] = 255;
}

/// Luma plane plus one plane of interleaved chroma pairs
fn semi_planar_to_rgba(
    luma: PlaneView<'_>,
    chroma: PlaneView<'_>,
    order: ChromaOrder,
    width: usize,
    height: usize,
    rgba: &mut [u8],
) {
    let (u_index, v_index) = match order {
        ChromaOrder::Uv => (0, 1),
        ChromaOrder::Vu => (1, 0),
    };

    for (row, out_row) in rgba.chunks_exact_mut(width * 4).take(height).enumerate() {
        let y_row = luma.row(row, width);
        let c_row = chroma.row(row / 2, width);

        for (x, pixel) in out_row.chunks_exact_mut(4).enumerate() {
            let pair = &c_row[(x / 2) * 2..(x / 2) * 2 + 2];
            yuv_to_rgba(y_row[x], pair[u_index], pair[v_index], pixel);
        }
    }
}

/// Luma plane plus separate U and V planes at quarter resolution
fn planar_to_rgba(
    luma: PlaneView<'_>,
    u_plane: PlaneView<'_>,
    v_plane: PlaneView<'_>,
    width: usize,
    height: usize,
    rgba: &mut [u8],
) {
    let chroma_width = width / 2;

    for (row, out_row) in rgba.chunks_exact_mut(width * 4).take(height).enumerate() {
        let y_row = luma.row(row, width);
        let u_row = u_plane.row(row / 2, chroma_width);
        let v_row = v_plane.row(row / 2, chroma_width);

        for (x, pixel) in out_row.chunks_exact_mut(4).enumerate() {
            yuv_to_rgba(y_row[x], u_row[x / 2], v_row[x / 2], pixel);
        }
    }
}
