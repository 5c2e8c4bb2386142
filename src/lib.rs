//! SignalHUD watches the radio environment around a small host, usually a
//! Raspberry Pi with a camera, a Wi-Fi interface, a Bluetooth adapter and
//! optionally a Flipper Zero on a USB serial port. Every nearby transmitter
//! it hears becomes a [`DeviceObservation`](observation::DeviceObservation)
//! in a shared [`SignalRegistry`](registry::SignalRegistry).
//!
//! When at least three of those transmitters are surveyed anchors with
//! known coordinates, the [`Localizer`](localizer::Localizer) turns their
//! signal strengths into distances and solves for where the host is.
//!
//! The registry contents, the position estimate and the camera stream are
//! pushed to every connected viewer on a fixed cadence by the
//! [`feed`] publisher. Slow viewers lose updates, they never slow anybody
//! else down. Alternatively the same picture is drawn straight into the
//! terminal by the [`gui`] module.
//!
//! The moving parts are wired together by [`engine::Engine`]:
//!
//! ```text
//!  wifi ─┐
//!  bt   ─┼─► SignalRegistry ─► Localizer ─► Publisher ─► viewers
//!  flip ─┘                                      ▲
//!  camera ──────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
pub mod args;
pub mod collector;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod feed;
pub mod gui;
pub mod localizer;
pub mod logging;
pub mod observation;
pub mod registry;
pub mod server;
pub mod video;

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// A position in the room frame, in metres.
#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

impl Point {
    /// Euclidean distance to `other`.
    pub fn abs_dist(&self, other: &Self) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

impl Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.3}, {:.3})", self.x, self.y)
    }
}
