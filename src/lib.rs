//! # framecap core library
//!
//! Capture server for a phone-to-workstation 3D scanning workflow. A mobile
//! client streams JPEG frames plus inertial samples over a persistent TCP
//! connection carrying one JSON object per line; the server persists each
//! capture session in a TUM-style directory layout and can score a finished
//! session for reconstruction readiness.
//!
//! ## Crate Structure
//!
//! - **`config`**: Settings loaded from defaults plus an optional TOML file.
//! - **`error`**: The `CaptureError` enum used across the crate.
//! - **`packet`**: Decoding of inbound frame packets (pure, no I/O).
//! - **`store`**: Session lifecycle, on-disk layout, statistics, and the
//!   background image writer pool.
//! - **`network`**: Wire protocol types, the per-connection state machine,
//!   and the TCP server with its periodic stats reporter.
//! - **`validate`**: Post-hoc quality assessment of a session directory.

pub mod config;
pub mod error;
pub mod network;
pub mod packet;
pub mod store;
pub mod validate;

/// Wall-clock time as fractional Unix seconds, the time base of the wire
/// protocol and the stored timestamps.
pub(crate) fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}
