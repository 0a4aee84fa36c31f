// WebSocket message types for collaborative sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ChangeEvent;

/// Inbound `type` tag that retargets the connection's change feed.
pub const SET_IMAGE_ID: &str = "setImageID";
/// Inbound `type` tag for an application-level ping.
pub const PING: &str = "ping";

/// Server -> Client frame: `{type, ...fields, sessionID, time}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEnvelope {
    #[serde(flatten)]
    pub event: ServerEvent,
    #[serde(rename = "sessionID")]
    pub session_id: Uuid,
    pub time: DateTime<Utc>,
}

impl ServerEnvelope {
    pub fn new(session_id: Uuid, event: ServerEvent) -> Self {
        Self { event, session_id, time: Utc::now() }
    }

    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }
}

/// All server-originated message types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Periodic liveness signal written by the connection's writer.
    Keepalive,

    /// A member connected to the session.
    MemberJoined {
        #[serde(rename = "memberID")]
        member_id: Uuid,
    },

    /// A member disconnected while the session stayed alive.
    MemberLeft {
        #[serde(rename = "memberID")]
        member_id: Uuid,
    },

    /// The session is over; the server closes the socket right after.
    SessionEnded { reason: SessionEndReason },

    /// Reply to a client `ping`.
    Pong,

    /// Acknowledges `setImageID`. Nothing for the previous subject follows it.
    Watching {
        #[serde(rename = "imageID")]
        image_id: String,
    },

    /// Changes observed on the watched subject.
    ChangeBatch {
        #[serde(rename = "imageID")]
        image_id: String,
        changes: Vec<ChangeEvent>,
    },
}

impl ServerEvent {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Keepalive => "keepalive",
            Self::MemberJoined { .. } => "member_joined",
            Self::MemberLeft { .. } => "member_left",
            Self::SessionEnded { .. } => "session_ended",
            Self::Pong => "pong",
            Self::Watching { .. } => "watching",
            Self::ChangeBatch { .. } => "change_batch",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    OwnerLeft,
    Deleted,
    ServerShutdown,
}

/// Client -> Server control frame after decoding `{type, payload}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SetImageId { image_id: String },
    Ping,
    /// Any tag this server does not understand. Never fatal.
    Unknown { kind: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ClientFrameError {
    #[error("malformed client frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("`{kind}` frame is missing `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
}

#[derive(Deserialize)]
struct RawClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Deserialize)]
struct SetImageIdPayload {
    #[serde(rename = "imageID")]
    image_id: Option<String>,
}

impl ClientMessage {
    pub fn decode(raw: &str) -> Result<Self, ClientFrameError> {
        let frame: RawClientFrame = serde_json::from_str(raw)?;
        match frame.kind.as_str() {
            SET_IMAGE_ID => {
                let payload: SetImageIdPayload = if frame.payload.is_null() {
                    SetImageIdPayload { image_id: None }
                } else {
                    serde_json::from_value(frame.payload)?
                };
                let image_id = payload.image_id.ok_or(ClientFrameError::MissingField {
                    kind: SET_IMAGE_ID,
                    field: "payload.imageID",
                })?;
                Ok(Self::SetImageId { image_id })
            }
            PING => Ok(Self::Ping),
            _ => Ok(Self::Unknown { kind: frame.kind }),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let value = match self {
            Self::SetImageId { image_id } => serde_json::json!({
                "type": SET_IMAGE_ID,
                "payload": { "imageID": image_id },
            }),
            Self::Ping => serde_json::json!({ "type": PING }),
            Self::Unknown { kind } => serde_json::json!({ "type": kind }),
        };
        serde_json::to_string(&value)
    }
}
