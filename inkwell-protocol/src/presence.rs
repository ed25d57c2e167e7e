//! Presence types: cursor, selection, IME composition, and profile.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionDirection {
    Forward,
    Backward,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_direction: Option<SelectionDirection>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: u32,
    pub end: u32,
}

/// Intermediate IME (input method editor) composition state. Only `commit`
/// mutates the document; the rest are presence-only broadcasts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ImeEvent {
    Start { range: Range },
    Update { range: Range, text: String },
    Commit { replace_range: Range, text: String },
    Cancel { range: Range },
}

/// Maximum length, in code points, of a presence label.
pub const MAX_LABEL_LEN: usize = 32;

/// Truncate `label` to [`MAX_LABEL_LEN`] code points.
pub fn truncate_label(label: &str) -> String {
    label.chars().take(MAX_LABEL_LEN).collect()
}

/// Validate a `#RRGGBB` color string.
pub fn is_valid_color(color: &str) -> bool {
    let bytes = color.as_bytes();
    bytes.len() == 7 && bytes[0] == b'#' && bytes[1..].iter().all(|b| b.is_ascii_hexdigit())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub client_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ime: Option<ImeEvent>,
    pub last_seen_ms: u64,
}

/// A diff broadcast: clients that joined, clients whose fields changed, and
/// clients that left or were idle-evicted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub added: Vec<PresenceEntry>,
    #[serde(default)]
    pub updated: Vec<PresenceEntry>,
    #[serde(default)]
    pub removed: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_labels() {
        let label = "x".repeat(100);
        assert_eq!(truncate_label(&label).chars().count(), MAX_LABEL_LEN);
    }

    #[test]
    fn validates_hex_color() {
        assert!(is_valid_color("#1a2B3c"));
        assert!(!is_valid_color("#1a2B3"));
        assert!(!is_valid_color("1a2B3c"));
        assert!(!is_valid_color("#1a2B3z"));
    }
}
