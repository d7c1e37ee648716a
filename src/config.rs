//! Configuration management.
//!
//! Settings are built from hard defaults, optionally overlaid with a TOML
//! file, and finally overridden by CLI flags in `main`. The validation
//! thresholds mirror the limits the downstream reconstruction pipeline
//! expects from a capture.

use crate::error::CaptureError;
use config::Config;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub validation: ValidationLimits,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub captures_dir: PathBuf,
    /// Upper bound for one wire message (a base64 frame plus metadata).
    pub max_message_bytes: usize,
    pub stats_interval_secs: u64,
    pub writer_workers: usize,
    /// How long `end()` and shutdown wait for the image queue to empty.
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ValidationLimits {
    /// Minimum frames for a valid capture.
    pub min_frames: usize,
    /// Gap between frames (seconds) that counts toward the aggregate warning.
    pub max_frame_gap: f64,
    /// Gap that additionally earns a per-occurrence warning.
    pub max_frame_gap_error: f64,
    /// Minimum capture duration in seconds.
    pub min_duration: f64,
}

impl Settings {
    pub fn load(config_file: Option<&str>) -> Result<Self, CaptureError> {
        let mut builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8765i64)?
            .set_default("server.captures_dir", "captures")?
            .set_default("server.max_message_bytes", 10 * 1024 * 1024i64)?
            .set_default("server.stats_interval_secs", 5i64)?
            .set_default("server.writer_workers", 2i64)?
            .set_default("server.drain_timeout_secs", 10i64)?
            .set_default("validation.min_frames", 30i64)?
            .set_default("validation.max_frame_gap", 0.5)?
            .set_default("validation.max_frame_gap_error", 2.0)?
            .set_default("validation.min_duration", 3.0)?;

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder
            .build()?
            .try_deserialize()
            .map_err(CaptureError::Config)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            captures_dir: PathBuf::from("captures"),
            max_message_bytes: 10 * 1024 * 1024,
            stats_interval_secs: 5,
            writer_workers: 2,
            drain_timeout_secs: 10,
        }
    }
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            min_frames: 30,
            max_frame_gap: 0.5,
            max_frame_gap_error: 2.0,
            min_duration: 3.0,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            validation: ValidationLimits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_config_file() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.server.port, 8765);
        assert_eq!(settings.server.captures_dir, PathBuf::from("captures"));
        assert_eq!(settings.validation.min_frames, 30);
        assert!((settings.validation.max_frame_gap - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn defaults_match_manual_default() {
        let loaded = Settings::load(None).unwrap();
        let manual = Settings::default();
        assert_eq!(loaded.server.port, manual.server.port);
        assert_eq!(loaded.server.writer_workers, manual.server.writer_workers);
        assert_eq!(loaded.validation.min_frames, manual.validation.min_frames);
    }
}
