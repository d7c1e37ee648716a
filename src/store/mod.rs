//! Session lifecycle and the on-disk capture layout.
//!
//! One capture session is current per process at any time. Starting a new
//! session synchronously finalizes the previous one. All mutation runs under
//! a single lock so concurrent connections streaming into the shared session
//! keep the IMU and frame-index logs in arrival order; image bytes go through
//! the background [`writer::FrameWriter`] and may land out of order, which is
//! fine because files are named by timestamp.
//!
//! Layout per session (TUM-style):
//!
//! ```text
//! captures/session_YYYYMMDD_HHMMSS/
//!   rgb/<timestamp>.jpg
//!   imu.csv
//!   rgb.txt
//!   intrinsics.json        (written once, first intrinsics-bearing frame)
//!   session_stats.json     (written at clean session end)
//! ```

pub mod writer;

use crate::error::AppResult;
use crate::packet::FramePacket;
use crate::unix_now;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const RGB_DIR: &str = "rgb";
pub const IMU_FILE: &str = "imu.csv";
pub const INDEX_FILE: &str = "rgb.txt";
pub const INTRINSICS_FILE: &str = "intrinsics.json";
pub const STATS_FILE: &str = "session_stats.json";
pub const FRAME_EXT: &str = "jpg";

const SESSION_PREFIX: &str = "session_";
const LATENCY_WINDOW: usize = 100;

/// Running statistics for the current session.
#[derive(Debug)]
pub struct SessionStats {
    pub session_id: String,
    pub start_time: f64,
    pub frame_count: u64,
    pub total_bytes: u64,
    pub last_frame_time: f64,
    /// Rolling window of the most recent latency samples, bounded so the
    /// average stays O(1) in memory regardless of session length.
    latencies: VecDeque<f64>,
}

impl SessionStats {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            start_time: unix_now(),
            frame_count: 0,
            total_bytes: 0,
            last_frame_time: 0.0,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }

    fn record(&mut self, timestamp: f64, byte_len: usize, latency_ms: f64) {
        self.frame_count += 1;
        self.total_bytes += byte_len as u64;
        self.last_frame_time = timestamp;
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency_ms);
    }

    pub fn duration(&self) -> f64 {
        (unix_now() - self.start_time).max(0.0)
    }

    pub fn fps(&self) -> f64 {
        let duration = self.duration();
        if duration > 0.0 {
            self.frame_count as f64 / duration
        } else {
            0.0
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
    }

    pub fn bandwidth_mbps(&self) -> f64 {
        let duration = self.duration();
        if duration > 0.0 {
            (self.total_bytes as f64 * 8.0) / (duration * 1_000_000.0)
        } else {
            0.0
        }
    }

    fn snapshot(&self, queue_size: usize) -> StatsSnapshot {
        StatsSnapshot {
            session_id: self.session_id.clone(),
            frame_count: self.frame_count,
            duration_sec: round2(self.duration()),
            fps: round2(self.fps()),
            avg_latency_ms: round2(self.avg_latency_ms()),
            bandwidth_mbps: round2(self.bandwidth_mbps()),
            total_mb: round2(self.total_bytes as f64 / (1024.0 * 1024.0)),
            queue_size,
        }
    }
}

/// Point-in-time view of [`SessionStats`], sent in acknowledgements and
/// persisted as the final stats record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub session_id: String,
    pub frame_count: u64,
    pub duration_sec: f64,
    pub fps: f64,
    pub avg_latency_ms: f64,
    pub bandwidth_mbps: f64,
    pub total_mb: f64,
    pub queue_size: usize,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

struct ActiveSession {
    id: String,
    path: PathBuf,
    imu_writer: csv::Writer<File>,
    index_file: File,
    intrinsics_saved: bool,
    stats: SessionStats,
}

/// Owner of the process-wide current session.
pub struct SessionStore {
    base_dir: PathBuf,
    writer: writer::FrameWriter,
    current: Mutex<Option<ActiveSession>>,
    drain_timeout: Duration,
}

impl SessionStore {
    /// Create the store and its writer pool. Fails if the base captures
    /// directory cannot be created; must be called from within a tokio
    /// runtime.
    pub fn new(
        base_dir: impl Into<PathBuf>,
        writer_workers: usize,
        drain_timeout: Duration,
    ) -> AppResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            writer: writer::FrameWriter::spawn(writer_workers),
            current: Mutex::new(None),
            drain_timeout,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Start a new session, finalizing any existing one first. Returns the
    /// session id (generated ids sort lexicographically by creation time).
    pub async fn create(&self, session_id: Option<String>) -> AppResult<String> {
        let mut slot = self.current.lock().await;
        self.finalize_locked(&mut slot).await;
        self.open_session_locked(&mut slot, session_id)
    }

    fn open_session_locked(
        &self,
        slot: &mut Option<ActiveSession>,
        session_id: Option<String>,
    ) -> AppResult<String> {
        let id = session_id.unwrap_or_else(default_session_id);
        let path = self.base_dir.join(&id);
        fs::create_dir_all(path.join(RGB_DIR))?;

        let mut imu_writer = csv::Writer::from_path(path.join(IMU_FILE))?;
        imu_writer.write_record([
            "timestamp", "accel_x", "accel_y", "accel_z", "gyro_x", "gyro_y", "gyro_z", "qw",
            "qx", "qy", "qz",
        ])?;
        imu_writer.flush()?;

        let mut index_file = File::create(path.join(INDEX_FILE))?;
        index_file.write_all(b"# timestamp filename\n")?;

        info!(session = %id, path = %path.display(), "created capture session");

        *slot = Some(ActiveSession {
            stats: SessionStats::new(id.clone()),
            id: id.clone(),
            path,
            imu_writer,
            index_file,
            intrinsics_saved: false,
        });
        Ok(id)
    }

    /// Append one frame to the current session, creating a session first if
    /// none exists. Image bytes are queued for background writing; the IMU
    /// row and the frame-index row are appended synchronously in arrival
    /// order. Returns `false` (and logs) instead of propagating, so one bad
    /// frame never tears down the session.
    pub async fn append(&self, packet: FramePacket) -> bool {
        let mut slot = self.current.lock().await;
        if slot.is_none() {
            info!("no active session, creating one implicitly");
            if let Err(e) = self.open_session_locked(&mut slot, None) {
                warn!("failed to create implicit session: {e}");
                return false;
            }
        }
        let Some(session) = slot.as_mut() else {
            return false;
        };

        let timestamp = packet.timestamp;
        let byte_len = packet.frame_data.len();
        let latency_ms = packet.latency_ms();

        match self.append_inner(session, packet).await {
            Ok(()) => {
                session.stats.record(timestamp, byte_len, latency_ms);
                true
            }
            Err(e) => {
                warn!(session = %session.id, "dropping frame: {e}");
                false
            }
        }
    }

    async fn append_inner(&self, session: &mut ActiveSession, packet: FramePacket) -> AppResult<()> {
        // Microsecond-precision timestamp doubles as the filename; identical
        // timestamps overwrite, which is accepted.
        let timestamp = format!("{:.6}", packet.timestamp);
        let filename = format!("{timestamp}.{FRAME_EXT}");

        self.writer
            .enqueue(session.path.join(RGB_DIR).join(&filename), packet.frame_data)
            .await?;

        if let Some(imu) = &packet.imu {
            session.imu_writer.write_record([
                timestamp.clone(),
                imu.accel[0].to_string(),
                imu.accel[1].to_string(),
                imu.accel[2].to_string(),
                imu.gyro[0].to_string(),
                imu.gyro[1].to_string(),
                imu.gyro[2].to_string(),
                imu.orientation[0].to_string(),
                imu.orientation[1].to_string(),
                imu.orientation[2].to_string(),
                imu.orientation[3].to_string(),
            ])?;
            session.imu_writer.flush()?;
        }

        writeln!(session.index_file, "{timestamp} {RGB_DIR}/{filename}")?;
        session.index_file.flush()?;

        if !session.intrinsics_saved {
            if let Some(intrinsics) = packet.intrinsics {
                let json = serde_json::to_vec_pretty(&Value::Object(intrinsics))?;
                fs::write(session.path.join(INTRINSICS_FILE), json)?;
                session.intrinsics_saved = true;
            }
        }

        Ok(())
    }

    /// Snapshot of the current session statistics, or `None` when no session
    /// is active. Safe to call concurrently with `append`.
    pub async fn stats(&self) -> Option<StatsSnapshot> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|s| s.stats.snapshot(self.writer.queue_len()))
    }

    pub async fn current_session(&self) -> Option<String> {
        self.current.lock().await.as_ref().map(|s| s.id.clone())
    }

    /// Finalize the current session: bounded drain of the image queue, close
    /// the append streams, persist the final stats record. A no-op when no
    /// session is active.
    pub async fn end(&self) -> Option<StatsSnapshot> {
        let mut slot = self.current.lock().await;
        self.finalize_locked(&mut slot).await
    }

    async fn finalize_locked(&self, slot: &mut Option<ActiveSession>) -> Option<StatsSnapshot> {
        let mut session = slot.take()?;
        let snapshot = session.stats.snapshot(self.writer.queue_len());

        if !self.writer.drain(self.drain_timeout).await {
            warn!(session = %session.id, "image queue did not drain before session close");
        }

        if let Err(e) = session.imu_writer.flush() {
            warn!(session = %session.id, "failed to flush IMU log: {e}");
        }
        if let Err(e) = session.index_file.flush() {
            warn!(session = %session.id, "failed to flush frame index: {e}");
        }

        match serde_json::to_vec_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = fs::write(session.path.join(STATS_FILE), json) {
                    warn!(session = %session.id, "failed to write final stats: {e}");
                }
            }
            Err(e) => warn!(session = %session.id, "failed to serialize final stats: {e}"),
        }

        info!(
            session = %snapshot.session_id,
            frames = snapshot.frame_count,
            duration_sec = snapshot.duration_sec,
            fps = snapshot.fps,
            "session ended"
        );
        Some(snapshot)
    }

    /// Recorded sessions under the base directory, newest first.
    pub fn list(&self) -> AppResult<Vec<SessionSummary>> {
        list_sessions(&self.base_dir)
    }

    /// Finalize any open session and stop the writer pool.
    pub async fn shutdown(&self) {
        self.end().await;
        self.writer.shutdown(self.drain_timeout).await;
    }
}

fn default_session_id() -> String {
    chrono::Local::now().format("session_%Y%m%d_%H%M%S").to_string()
}

/// Descriptor of one stored session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub path: PathBuf,
    pub frame_count: u64,
    /// Final stats, present only when the session was cleanly ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSnapshot>,
}

/// List sessions under `base_dir`, newest first by id. Sessions that were
/// never cleanly ended fall back to counting image files.
pub fn list_sessions(base_dir: &Path) -> AppResult<Vec<SessionSummary>> {
    let mut sessions = Vec::new();
    if !base_dir.exists() {
        return Ok(sessions);
    }

    for entry in fs::read_dir(base_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            continue;
        };
        if !path.is_dir() || !name.starts_with(SESSION_PREFIX) {
            continue;
        }

        let stats = fs::read(path.join(STATS_FILE))
            .ok()
            .and_then(|bytes| serde_json::from_slice::<StatsSnapshot>(&bytes).ok());
        let frame_count = match &stats {
            Some(s) => s.frame_count,
            None => count_frames(&path.join(RGB_DIR)),
        };

        sessions.push(SessionSummary {
            session_id: name,
            path,
            frame_count,
            stats,
        });
    }

    sessions.sort_by(|a, b| b.session_id.cmp(&a.session_id));
    Ok(sessions)
}

fn count_frames(rgb_dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(rgb_dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| {
            e.path()
                .extension()
                .map_or(false, |ext| ext == FRAME_EXT)
        })
        .count() as u64
}
