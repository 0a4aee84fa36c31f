// Core domain types shared across tandem crates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of a collaborative session a connection represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    /// The participant who created the session. Exactly one per session.
    Owner,
    Member,
}

impl ParticipantRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Member => "member",
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of mutation reported by the change feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Insert,
    Update,
    Replace,
    Delete,
}

/// A single document change on a watched subject (e.g. a label on an image).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    #[serde(rename = "documentID")]
    pub document_id: String,
    /// Full document after the change. Absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,
}
