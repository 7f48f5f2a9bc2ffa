// SPDX-License-Identifier: MPL-2.0

//! Preview pipeline and frame consumers
//!
//! ```text
//! ┌──────────────┐     ┌────────────────────┐     ┌──────────────────┐
//! │   Provider   │ ──▶ │  Capture worker    │ ──▶ │  Frame consumer  │
//! │ (V4L2/synth) │     │  - open/configure  │     │  - MarkerStage   │
//! │              │     │  - acquire latest  │     │  - CLI snapshot  │
//! └──────────────┘     └────────────────────┘     └──────────────────┘
//!         ▲                      ▲
//!         └──── PreviewPipeline ─┘  start / on_resize / stop
//! ```
//!
//! # Modules
//!
//! - [`preview`]: the facade a host drives
//! - [`marker`]: marker detection and calibration consumer

pub mod marker;
pub mod preview;

pub use marker::{MarkerControl, MarkerStage};
pub use preview::{Notice, PreviewPipeline};
