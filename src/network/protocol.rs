//! Wire protocol messages.
//!
//! Every message is one JSON object per line. Inbound messages are either
//! data messages (a `frame` payload, optionally tagged `type: "frame"`) or
//! control messages (`type: "control"`, dispatched by `command`). Server
//! replies are tagged `type` ∈ {`status`, `ack`, `error`}.

use crate::store::StatsSnapshot;
use serde::Serialize;
use serde_json::Value;

/// Classification of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Frame,
    Control,
    Unknown,
}

/// Classify a parsed inbound message. An untagged message is treated as a
/// data message, matching what streaming clients actually send.
pub fn classify(message: &Value) -> MessageKind {
    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("frame");
    if msg_type == "frame" || message.get("frame").is_some() {
        MessageKind::Frame
    } else if msg_type == "control" {
        MessageKind::Control
    } else {
        MessageKind::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    StartSession,
    EndSession,
    Pause,
    Resume,
    GetStatus,
    Ping,
}

impl ControlCommand {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "start_session" => Some(Self::StartSession),
            "end_session" => Some(Self::EndSession),
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "get_status" => Some(Self::GetStatus),
            "ping" => Some(Self::Ping),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartSession => "start_session",
            Self::EndSession => "end_session",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::GetStatus => "get_status",
            Self::Ping => "ping",
        }
    }
}

/// Outbound server message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Status(StatusBody),
    Ack(AckBody),
    Error { error: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Current session in a `get_status` reply; may be null while idle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clients: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AckBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_time: Option<f64>,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn welcome(client_id: String, server_time: f64) -> Self {
        Self::Status(StatusBody {
            client_id: Some(client_id),
            message: Some("Connected to framecap server".to_string()),
            server_time: Some(server_time),
            ..StatusBody::default()
        })
    }

    pub fn frame_ack(frame_count: u64, stats: Option<StatsSnapshot>) -> Self {
        Self::Ack(AckBody {
            frame_count: Some(frame_count),
            stats,
            ..AckBody::default()
        })
    }

    pub fn pong(server_time: f64, client_time: f64) -> Self {
        Self::Ack(AckBody {
            command: Some("pong"),
            server_time: Some(server_time),
            client_time: Some(client_time),
            ..AckBody::default()
        })
    }
}
