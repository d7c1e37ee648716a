//! Frame packet decoding.
//!
//! A data message from the client is a JSON object with a base64 `frame`
//! payload and optional `timestamp`, `imu`, and `camera_intrinsics` fields.
//! Decoding is pure: it never touches the network or the disk.

use crate::error::{AppResult, CaptureError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Camera intrinsics are stored verbatim as the client sent them, so a
/// sloppy client payload shows up in validation instead of being silently
/// normalized.
pub type IntrinsicsMap = serde_json::Map<String, Value>;

/// One inertial sample attached to a frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    #[serde(default)]
    pub accel: [f64; 3],
    #[serde(default)]
    pub gyro: [f64; 3],
    #[serde(default = "identity_quat")]
    pub orientation: [f64; 4],
}

fn identity_quat() -> [f64; 4] {
    [1.0, 0.0, 0.0, 0.0]
}

/// A single decoded frame packet. Immutable once parsed.
#[derive(Clone, Debug)]
pub struct FramePacket {
    /// Capture timestamp in Unix seconds, as reported by the client clock.
    pub timestamp: f64,
    /// Opaque compressed image bytes, stored verbatim.
    pub frame_data: Vec<u8>,
    pub imu: Option<ImuSample>,
    pub intrinsics: Option<IntrinsicsMap>,
    /// Server receipt time in Unix seconds.
    pub received_at: f64,
}

impl FramePacket {
    /// Network latency in milliseconds. Negative when the client clock runs
    /// ahead of the server clock; reported as-is, never corrected.
    pub fn latency_ms(&self) -> f64 {
        (self.received_at - self.timestamp) * 1000.0
    }
}

/// Parse a JSON data message into a [`FramePacket`].
///
/// A missing or empty `frame` field decodes to zero-length bytes, which is
/// not an error at this layer. A missing `timestamp` defaults to the receipt
/// time; missing or empty `imu`/`camera_intrinsics` objects decode to `None`.
pub fn parse_frame_packet(data: &Value, received_at: f64) -> AppResult<FramePacket> {
    let obj = data.as_object().ok_or_else(|| {
        CaptureError::MalformedPacket("frame message is not a JSON object".to_string())
    })?;

    let frame_data = match obj.get("frame") {
        Some(Value::String(b64)) if !b64.is_empty() => BASE64
            .decode(b64.as_bytes())
            .map_err(|e| CaptureError::MalformedPacket(format!("invalid base64 frame: {e}")))?,
        None | Some(Value::String(_)) | Some(Value::Null) => Vec::new(),
        Some(other) => {
            return Err(CaptureError::MalformedPacket(format!(
                "frame payload must be a base64 string, got {other}"
            )))
        }
    };

    let timestamp = obj
        .get("timestamp")
        .and_then(Value::as_f64)
        .unwrap_or(received_at);

    let imu = match obj.get("imu") {
        Some(Value::Object(m)) if !m.is_empty() => Some(
            serde_json::from_value::<ImuSample>(Value::Object(m.clone()))
                .map_err(|e| CaptureError::MalformedPacket(format!("invalid imu record: {e}")))?,
        ),
        _ => None,
    };

    let intrinsics = match obj.get("camera_intrinsics") {
        Some(Value::Object(m)) if !m.is_empty() => Some(m.clone()),
        _ => None,
    };

    Ok(FramePacket {
        timestamp,
        frame_data,
        imu,
        intrinsics,
        received_at,
    })
}
