//! Capture session validation.
//!
//! Operates on a session directory after the fact, independently of the live
//! ingestion path: frame timestamps are re-derived from the stored filenames
//! and the logs are read back from disk. Findings accumulate in a report
//! instead of being raised, so one bad characteristic never prevents
//! reporting on the rest. Only missing structural prerequisites (no session,
//! no `rgb/`, no frames, unparseable timestamps) short-circuit.

use crate::config::ValidationLimits;
use crate::store::{IMU_FILE, INDEX_FILE, INTRINSICS_FILE, RGB_DIR};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

const REQUIRED_INTRINSICS: [&str; 6] = ["fx", "fy", "cx", "cy", "width", "height"];

/// Result of validating one session. Quality starts at 100 and every
/// finding deducts its penalty, floored at 0; warnings alone never
/// invalidate.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub session_id: String,
    pub is_valid: bool,
    pub quality_score: i32,

    pub frame_count: usize,
    pub duration_sec: f64,
    pub avg_fps: f64,
    pub min_fps: f64,
    pub max_fps: f64,

    pub width: u32,
    pub height: u32,
    pub resolution_consistent: bool,

    pub imu_records: usize,
    pub imu_synced: bool,
    pub imu_avg_offset_ms: f64,

    pub has_intrinsics: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intrinsics: Option<Value>,

    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
}

impl ValidationReport {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            is_valid: true,
            quality_score: 100,
            frame_count: 0,
            duration_sec: 0.0,
            avg_fps: 0.0,
            min_fps: 0.0,
            max_fps: 0.0,
            width: 0,
            height: 0,
            resolution_consistent: true,
            imu_records: 0,
            imu_synced: true,
            imu_avg_offset_ms: 0.0,
            has_intrinsics: false,
            intrinsics: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            info: Vec::new(),
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>, penalty: i32) {
        self.errors.push(message.into());
        self.quality_score = (self.quality_score - penalty).max(0);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, message: impl Into<String>, penalty: i32) {
        self.warnings.push(message.into());
        self.quality_score = (self.quality_score - penalty).max(0);
    }

    pub fn add_info(&mut self, message: impl Into<String>) {
        self.info.push(message.into());
    }
}

/// Validate a session directory against structural and temporal invariants.
/// Read-only; never mutates the session.
pub fn validate_session(session_path: &Path, limits: &ValidationLimits) -> ValidationReport {
    let session_id = session_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string();
    let mut report = ValidationReport::new(session_id);

    if !session_path.exists() {
        report.add_error(
            format!("Session path does not exist: {}", session_path.display()),
            100,
        );
        return report;
    }

    let rgb_dir = session_path.join(RGB_DIR);
    if !rgb_dir.exists() {
        report.add_error("No rgb/ directory found", 100);
        return report;
    }

    let frames = list_frames(&rgb_dir);
    report.frame_count = frames.len();
    if frames.is_empty() {
        report.add_error("No frames found in rgb/", 100);
        return report;
    }
    if report.frame_count < limits.min_frames {
        report.add_error(
            format!(
                "Too few frames: {} < {} minimum",
                report.frame_count, limits.min_frames
            ),
            30,
        );
    }

    let timestamps: Vec<f64> = frames.iter().filter_map(|p| parse_timestamp(p)).collect();
    if timestamps.len() < 2 {
        report.add_error("Cannot determine timestamps from filenames", 50);
        return report;
    }

    check_timing(&mut report, &timestamps, limits);
    check_dimensions(&mut report, &frames);
    check_imu(&mut report, session_path, &timestamps);
    check_intrinsics(&mut report, session_path);
    check_frame_index(&mut report, session_path);
    add_advisories(&mut report);

    report
}

/// Frame files sorted by name, the order the downstream tooling reads them
/// in. The monotonicity check runs over this order, not over re-sorted
/// numeric timestamps.
fn list_frames(rgb_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(rgb_dir) else {
        return Vec::new();
    };
    let mut frames: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "jpg"))
        .collect();
    frames.sort();
    frames
}

/// Extract the capture timestamp from a filename like `1234567890.123456.jpg`.
fn parse_timestamp(path: &Path) -> Option<f64> {
    path.file_stem()?
        .to_str()?
        .parse::<f64>()
        .ok()
        .filter(|ts| *ts > 0.0)
}

fn check_timing(report: &mut ValidationReport, timestamps: &[f64], limits: &ValidationLimits) {
    let first = timestamps[0];
    let last = timestamps[timestamps.len() - 1];
    report.duration_sec = last - first;

    if report.duration_sec < limits.min_duration {
        report.add_error(
            format!(
                "Capture too short: {:.1}s < {}s minimum",
                report.duration_sec, limits.min_duration
            ),
            20,
        );
    }
    if report.duration_sec > 0.0 {
        report.avg_fps = report.frame_count as f64 / report.duration_sec;
    }

    let mut fps_values = Vec::new();
    let mut gap_count = 0usize;

    for window in timestamps.windows(2) {
        let gap = window[1] - window[0];
        if gap > 0.0 {
            fps_values.push(1.0 / gap);
        }
        if gap > limits.max_frame_gap_error {
            gap_count += 1;
            report.add_warning(format!("Large gap between frames: {gap:.2}s"), 5);
        } else if gap > limits.max_frame_gap {
            gap_count += 1;
        }
    }

    if let Some(min) = fps_values.iter().copied().reduce(f64::min) {
        report.min_fps = min;
    }
    if let Some(max) = fps_values.iter().copied().reduce(f64::max) {
        report.max_fps = max;
    }

    if gap_count > 0 {
        report.add_warning(
            format!(
                "{gap_count} frame gaps > {}s detected",
                limits.max_frame_gap
            ),
            5,
        );
    }

    // Any decrease is one hard error, independent of how many exist.
    let monotonic = timestamps.windows(2).all(|w| w[0] <= w[1]);
    if !monotonic {
        report.add_error("Timestamps are not monotonic (frames out of order)", 30);
    }
}

fn check_dimensions(report: &mut ValidationReport, frames: &[PathBuf]) {
    let (width, height) = match image::image_dimensions(&frames[0]) {
        Ok(dims) => dims,
        Err(e) => {
            report.add_error(format!("Error reading images: {e}"), 20);
            return;
        }
    };
    report.width = width;
    report.height = height;

    if frames.len() > 1 {
        match image::image_dimensions(&frames[frames.len() - 1]) {
            Ok(last) if last != (width, height) => {
                report.resolution_consistent = false;
                report.add_warning(
                    format!(
                        "Resolution changed: {width}x{height} -> {}x{}",
                        last.0, last.1
                    ),
                    10,
                );
            }
            Ok(_) => {}
            Err(e) => {
                report.add_error(format!("Error reading images: {e}"), 20);
                return;
            }
        }
    }

    // For long captures probe three evenly spaced samples, stopping at the
    // first mismatch found.
    if frames.len() > 20 {
        let n = frames.len();
        for idx in [n / 4, n / 2, 3 * n / 4] {
            match image::image_dimensions(&frames[idx]) {
                Ok(dims) if dims != (width, height) => {
                    report.resolution_consistent = false;
                    report.add_warning(format!("Resolution inconsistent at frame {idx}"), 5);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    report.add_error(format!("Error reading images: {e}"), 20);
                    return;
                }
            }
        }
    }
}

fn check_imu(report: &mut ValidationReport, session_path: &Path, timestamps: &[f64]) {
    let imu_path = session_path.join(IMU_FILE);
    if !imu_path.exists() {
        report.add_warning("No IMU data file found", 15);
        report.imu_synced = false;
        return;
    }

    let imu_timestamps = match read_imu_timestamps(&imu_path) {
        Ok(rows) => rows,
        Err(e) => {
            report.add_warning(format!("Error reading IMU data: {e}"), 10);
            return;
        }
    };
    report.imu_records = imu_timestamps.len();

    if imu_timestamps.is_empty() {
        report.add_warning("IMU file exists but is empty", 10);
        return;
    }

    let ratio = report.imu_records as f64 / report.frame_count.max(1) as f64;
    if ratio < 1.0 {
        report.add_warning(format!("Low IMU rate: {ratio:.1} samples/frame"), 5);
    }

    let imu_start = imu_timestamps.iter().copied().fold(f64::INFINITY, f64::min);
    let imu_end = imu_timestamps
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let frame_start = timestamps[0];
    let frame_end = timestamps[timestamps.len() - 1];

    // The IMU log should roughly span the frame timestamps, with one second
    // of slack on each end.
    if imu_start > frame_start + 1.0 {
        report.add_warning("IMU data starts late", 5);
    }
    if imu_end < frame_end - 1.0 {
        report.add_warning("IMU data ends early", 5);
    }
    report.imu_avg_offset_ms = (imu_start - frame_start).abs() * 1000.0;
}

fn read_imu_timestamps(path: &Path) -> Result<Vec<f64>, String> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| e.to_string())?;
    let mut timestamps = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        let Some(field) = record.get(0) else { continue };
        let ts: f64 = field
            .parse()
            .map_err(|e| format!("bad timestamp {field:?}: {e}"))?;
        timestamps.push(ts);
    }
    Ok(timestamps)
}

fn check_intrinsics(report: &mut ValidationReport, session_path: &Path) {
    let path = session_path.join(INTRINSICS_FILE);
    if !path.exists() {
        report.add_warning("No intrinsics.json found", 15);
        return;
    }

    let intrinsics: Value = match fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(value) => value,
        Err(e) => {
            report.add_warning(format!("Error reading intrinsics: {e}"), 10);
            return;
        }
    };
    report.has_intrinsics = true;

    let missing: Vec<&str> = REQUIRED_INTRINSICS
        .iter()
        .filter(|key| intrinsics.get(**key).is_none())
        .copied()
        .collect();
    if !missing.is_empty() {
        report.add_warning(format!("Missing intrinsic fields: {missing:?}"), 5);
    }

    if report.width > 0 {
        let intr_w = intrinsics.get("width").and_then(Value::as_u64).unwrap_or(0);
        let intr_h = intrinsics
            .get("height")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if intr_w != u64::from(report.width) || intr_h != u64::from(report.height) {
            report.add_warning(
                format!(
                    "Intrinsics resolution ({intr_w}x{intr_h}) != actual ({}x{})",
                    report.width, report.height
                ),
                10,
            );
        }
    }

    report.intrinsics = Some(intrinsics);
}

fn check_frame_index(report: &mut ValidationReport, session_path: &Path) {
    let path = session_path.join(INDEX_FILE);
    if !path.exists() {
        report.add_warning("No rgb.txt (frame index) found", 5);
        return;
    }

    match fs::read_to_string(&path) {
        Ok(text) => {
            let entries = text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .count();
            if entries != report.frame_count {
                report.add_warning(
                    format!(
                        "rgb.txt has {entries} entries but {} frames",
                        report.frame_count
                    ),
                    5,
                );
            }
        }
        Err(e) => report.add_warning(format!("Error reading rgb.txt: {e}"), 5),
    }
}

/// Advisory notes only; these never affect the score.
fn add_advisories(report: &mut ValidationReport) {
    if report.avg_fps < 8.0 {
        report.add_info("Consider higher FPS for better reconstruction quality");
    }
    if report.avg_fps > 20.0 {
        report.add_info("High FPS captured - good for fast motion");
    }
    if report.frame_count > 500 {
        report.add_info("Large capture - reconstruction may take a while");
    }
    if report.duration_sec < 10.0 {
        report.add_info("Short capture - ensure scene coverage is adequate");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IMU_FILE, INDEX_FILE, INTRINSICS_FILE, RGB_DIR};
    use std::io::Write as _;
    use tempfile::tempdir;

    fn limits() -> ValidationLimits {
        ValidationLimits::default()
    }

    /// Write a real (tiny) JPEG so the dimension probe exercises the same
    /// path it takes on production captures.
    fn write_frame(session: &Path, ts: f64, width: u32, height: u32) {
        let path = session.join(RGB_DIR).join(format!("{ts:.6}.jpg"));
        image::RgbImage::new(width, height).save(&path).unwrap();
    }

    fn make_session(dir: &Path, name: &str) -> PathBuf {
        let session = dir.join(name);
        fs::create_dir_all(session.join(RGB_DIR)).unwrap();
        session
    }

    fn write_imu(session: &Path, timestamps: &[f64]) {
        let mut writer = csv::Writer::from_path(session.join(IMU_FILE)).unwrap();
        writer
            .write_record([
                "timestamp", "accel_x", "accel_y", "accel_z", "gyro_x", "gyro_y", "gyro_z",
                "qw", "qx", "qy", "qz",
            ])
            .unwrap();
        for ts in timestamps {
            writer
                .write_record([
                    ts.to_string(),
                    "0.0".into(),
                    "0.0".into(),
                    "9.8".into(),
                    "0.0".into(),
                    "0.0".into(),
                    "0.0".into(),
                    "1.0".into(),
                    "0.0".into(),
                    "0.0".into(),
                    "0.0".into(),
                ])
                .unwrap();
        }
        writer.flush().unwrap();
    }

    fn write_index(session: &Path, timestamps: &[f64]) {
        let mut file = fs::File::create(session.join(INDEX_FILE)).unwrap();
        writeln!(file, "# timestamp filename").unwrap();
        for ts in timestamps {
            writeln!(file, "{ts:.6} rgb/{ts:.6}.jpg").unwrap();
        }
    }

    #[test]
    fn missing_session_is_terminal() {
        let report = validate_session(Path::new("/nonexistent/session_x"), &limits());
        assert!(!report.is_valid);
        assert_eq!(report.quality_score, 0);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn empty_rgb_dir_is_terminal() {
        let dir = tempdir().unwrap();
        let session = make_session(dir.path(), "session_empty");
        let report = validate_session(&session, &limits());
        assert!(!report.is_valid);
        assert_eq!(report.quality_score, 0);
        assert!(report.errors[0].contains("No frames"));
    }

    #[test]
    fn score_floors_at_zero() {
        let dir = tempdir().unwrap();
        let session = make_session(dir.path(), "session_bad");
        // Too few frames, too short, out of order, a hard gap, and every
        // optional file missing: cumulative penalties far exceed 100.
        // Mixed-width names make the sorted file order non-monotonic.
        for ts in [1.0, 10.5, 2.0] {
            write_frame(&session, ts, 4, 4);
        }
        let report = validate_session(&session, &limits());
        assert!(!report.is_valid);
        assert_eq!(report.quality_score, 0);
    }

    #[test]
    fn monotonicity_violation_is_exactly_one_error() {
        let dir = tempdir().unwrap();
        let session = make_session(dir.path(), "session_mono");
        // Sorted by filename these read 1.0, 10.5, 2.0, 30.0, 4.0: two
        // separate decreases, still exactly one monotonicity error.
        for ts in [1.0, 10.5, 2.0, 30.0, 4.0] {
            write_frame(&session, ts, 4, 4);
        }
        let report = validate_session(&session, &limits());
        let monotonic_errors = report
            .errors
            .iter()
            .filter(|e| e.contains("not monotonic"))
            .count();
        assert_eq!(monotonic_errors, 1);
    }

    #[test]
    fn gap_detection_matches_thresholds() {
        let dir = tempdir().unwrap();
        let session = make_session(dir.path(), "session_gaps");
        // Deltas: 0.1, 2.5, 0.1 with soft=0.5 and hard=2.0. The 2.5s delta
        // earns both the per-occurrence and the aggregate warning; the small
        // deltas earn neither.
        for ts in [10.0, 10.1, 12.6, 12.7] {
            write_frame(&session, ts, 4, 4);
        }
        let report = validate_session(&session, &limits());

        let per_occurrence = report
            .warnings
            .iter()
            .filter(|w| w.contains("Large gap"))
            .count();
        let aggregate = report
            .warnings
            .iter()
            .filter(|w| w.contains("frame gaps >"))
            .count();
        assert_eq!(per_occurrence, 1);
        assert_eq!(aggregate, 1);
        assert!(report.warnings.iter().all(|w| !w.contains("0.10")));
    }

    #[test]
    fn unparseable_filenames_still_count_as_frames() {
        let dir = tempdir().unwrap();
        let session = make_session(dir.path(), "session_names");
        write_frame(&session, 1.0, 4, 4);
        fs::write(session.join(RGB_DIR).join("cover.jpg"), b"junk").unwrap();
        let report = validate_session(&session, &limits());
        // Only one parseable timestamp: temporal checks abort early, but the
        // junk file was still counted.
        assert_eq!(report.frame_count, 2);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("Cannot determine timestamps")));
    }

    #[test]
    fn resolution_change_is_warning_not_error() {
        let dir = tempdir().unwrap();
        let session = make_session(dir.path(), "session_res");
        for i in 0..4 {
            write_frame(&session, 100.0 + i as f64, 8, 6);
        }
        write_frame(&session, 104.0, 16, 12);
        let report = validate_session(&session, &limits());
        assert!(!report.resolution_consistent);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("Resolution changed")));
        assert!(report.errors.iter().all(|e| !e.contains("Resolution")));
        assert_eq!(report.width, 8);
        assert_eq!(report.height, 6);
    }

    #[test]
    fn missing_imu_clears_sync_flag() {
        let dir = tempdir().unwrap();
        let session = make_session(dir.path(), "session_noimu");
        write_frame(&session, 1.0, 4, 4);
        write_frame(&session, 1.1, 4, 4);
        let report = validate_session(&session, &limits());
        assert!(!report.imu_synced);
        assert!(report.warnings.iter().any(|w| w.contains("No IMU data")));
    }

    #[test]
    fn imu_span_slack_warnings() {
        let dir = tempdir().unwrap();
        let session = make_session(dir.path(), "session_imuspan");
        for i in 0..40 {
            write_frame(&session, 100.0 + i as f64 * 0.1, 4, 4);
        }
        // IMU starts 2s after the frames and stops 2s early.
        let imu: Vec<f64> = (0..10).map(|i| 102.0 + i as f64 * 0.01).collect();
        write_imu(&session, &imu);
        let report = validate_session(&session, &limits());
        assert!(report.warnings.iter().any(|w| w.contains("starts late")));
        assert!(report.warnings.iter().any(|w| w.contains("ends early")));
        assert!(report.warnings.iter().any(|w| w.contains("Low IMU rate")));
    }

    #[test]
    fn intrinsics_missing_fields_warned() {
        let dir = tempdir().unwrap();
        let session = make_session(dir.path(), "session_intr");
        write_frame(&session, 1.0, 4, 4);
        write_frame(&session, 1.1, 4, 4);
        fs::write(
            session.join(INTRINSICS_FILE),
            r#"{"fx": 1000.0, "fy": 1000.0}"#,
        )
        .unwrap();
        let report = validate_session(&session, &limits());
        assert!(report.has_intrinsics);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("Missing intrinsic fields")));
    }

    #[test]
    fn clean_session_scores_100() {
        let dir = tempdir().unwrap();
        let session = make_session(dir.path(), "session_clean");

        // 40 frames at ~100ms spacing, matching intrinsics, IMU log at 10
        // samples per frame spanning the capture.
        let frame_ts: Vec<f64> = (0..40).map(|i| 1000.0 + i as f64 * 0.1).collect();
        for ts in &frame_ts {
            write_frame(&session, *ts, 32, 24);
        }
        let imu_ts: Vec<f64> = (0..400).map(|i| 1000.0 + i as f64 * 0.01).collect();
        write_imu(&session, &imu_ts);
        write_index(&session, &frame_ts);
        fs::write(
            session.join(INTRINSICS_FILE),
            r#"{"fx": 1000.0, "fy": 1000.0, "cx": 16.0, "cy": 12.0, "width": 32, "height": 24}"#,
        )
        .unwrap();

        let report = validate_session(&session, &limits());
        assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
        assert_eq!(report.quality_score, 100);
        assert!(report.is_valid);
        assert_eq!(report.frame_count, 40);
        assert_eq!(report.imu_records, 400);
        assert!((report.avg_fps - 40.0 / 3.9).abs() < 0.2);
    }

    #[test]
    fn index_count_mismatch_is_warning() {
        let dir = tempdir().unwrap();
        let session = make_session(dir.path(), "session_idx");
        let frame_ts: Vec<f64> = (0..35).map(|i| 1000.0 + i as f64 * 0.1).collect();
        for ts in &frame_ts {
            write_frame(&session, *ts, 4, 4);
        }
        write_index(&session, &frame_ts[..30]);
        let report = validate_session(&session, &limits());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("rgb.txt has 30 entries but 35 frames")));
    }
}
