// SPDX-License-Identifier: MPL-2.0

//! Backend abstraction layer for camera capture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               Preview Pipeline               │
//! └────────────────────┬────────────────────────┘
//!                      │
//! ┌────────────────────┴────────────────────────┐
//! │                Camera Backend                │
//! │  ┌─────────────┐    ┌──────────────────┐   │
//! │  │    V4L2     │    │    Synthetic     │   │
//! │  │  (Linux)    │    │  (test pattern)  │   │
//! │  └─────────────┘    └──────────────────┘   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`camera`]: providers, the capture worker and the session state machine

pub mod camera;
