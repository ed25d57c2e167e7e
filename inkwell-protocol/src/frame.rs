//! The WebSocket wire protocol: one tagged union per direction.
//!
//! Both directions are plain JSON text frames. An inbound frame with an
//! unrecognized `type` deserializes to [`ClientFrame::Unknown`] instead of
//! failing, so older and newer clients stay forward compatible with each
//! other (see Design Note 1).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ot::Operation;
use crate::presence::{CursorState, ImeEvent, PresenceDiff, PresenceEntry};
use crate::slug::Slug;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub base_rev: u64,
    pub ops: Vec<Operation>,
    pub author_id: Uuid,
    pub op_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_before: Option<CursorState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_after: Option<CursorState>,
    pub ts: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Frames sent by a client to the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        slug: Slug,
        #[serde(default)]
        client_id_hint: Option<u64>,
    },
    Edit(EditRequest),
    Cursor(CursorState),
    Ime(ImeEvent),
    Profile(ProfileUpdate),
    Ping,
    /// Forward-compatibility catch-all for frame types this server version
    /// doesn't understand yet.
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    BaseTooOld,
    Malformed,
    Unauthorised,
    StorageUnavailable,
    RateLimited,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "auth", rename_all = "snake_case")]
pub enum AuthOutcome {
    Ok,
    NeedsPassword,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotFrame {
    pub rev: u64,
    pub text: String,
    pub presence: Vec<PresenceEntry>,
    pub auth: AuthOutcome,
}

/// Frames sent by the server to a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Snapshot(SnapshotFrame),
    /// Sent to every subscriber, including the author, whose `op_id` lets
    /// the author correlate this with its own pending edit (combined
    /// ack + broadcast).
    Applied {
        rev: u64,
        op_id: Uuid,
        author_id: Uuid,
        ops: Vec<Operation>,
    },
    Rejected {
        op_id: Uuid,
        reason: RejectReason,
    },
    PresenceSnapshot {
        clients: Vec<PresenceEntry>,
    },
    PresenceDiffFrame(PresenceDiff),
    Pong,
    Error {
        message: String,
    },
}
