// REST bodies for session creation and joining.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSessionRequest {
    #[serde(rename = "batchID")]
    pub batch_id: Uuid,
}

/// Returned by every endpoint that hands out a join token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTokenResponse {
    #[serde(rename = "sessionID")]
    pub session_id: Uuid,
    pub token: String,
    /// Seconds until `token` stops being accepted.
    #[serde(rename = "expiresIn")]
    pub expires_in: i64,
    /// Upgrade URL the token is meant for.
    #[serde(rename = "wsURL")]
    pub ws_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStatusResponse {
    #[serde(rename = "sessionID")]
    pub session_id: Uuid,
    #[serde(rename = "batchID")]
    pub batch_id: Uuid,
    /// Whether the hub currently holds a live session for this record.
    pub live: bool,
    #[serde(rename = "ownerConnected")]
    pub owner_connected: bool,
    #[serde(rename = "memberCount")]
    pub member_count: usize,
}
