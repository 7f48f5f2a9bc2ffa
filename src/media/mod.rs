// SPDX-License-Identifier: MPL-2.0

//! Frame views and colour conversion
//!
//! Camera frames arrive as YUV 4:2:0 in one of three layouts (legacy NV21,
//! legacy YV12, or separate luma and interleaved chroma planes). The
//! [`frame`] module wraps an acquired image in a borrowed [`FrameBuffer`];
//! [`converter`] derives the gray and RGBA views from it.

pub mod converter;
pub mod frame;

pub use frame::{FrameBuffer, GrayView, PlaneView};
