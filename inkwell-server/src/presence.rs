//! Presence registry: cursor/IME/label/color tracking with idle eviction.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use inkwell_protocol::{is_valid_color, truncate_label, CursorState, ImeEvent, PresenceDiff, PresenceEntry};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[derive(Default)]
pub struct PresenceRegistry {
    entries: HashMap<u64, PresenceEntry>,
}

impl PresenceRegistry {
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn join(&mut self, client_id: u64) -> PresenceEntry {
        let entry = PresenceEntry {
            client_id,
            label: None,
            color: None,
            cursor: None,
            ime: None,
            last_seen_ms: now_ms(),
        };
        self.entries.insert(client_id, entry.clone());
        entry
    }

    pub fn leave(&mut self, client_id: u64) -> bool {
        self.entries.remove(&client_id).is_some()
    }

    pub fn touch(&mut self, client_id: u64) {
        if let Some(entry) = self.entries.get_mut(&client_id) {
            entry.last_seen_ms = now_ms();
        }
    }

    pub fn update_cursor(&mut self, client_id: u64, cursor: CursorState) -> Option<PresenceEntry> {
        let entry = self.entries.get_mut(&client_id)?;
        entry.cursor = Some(cursor);
        entry.last_seen_ms = now_ms();
        Some(entry.clone())
    }

    pub fn update_ime(&mut self, client_id: u64, ime: ImeEvent) -> Option<PresenceEntry> {
        let entry = self.entries.get_mut(&client_id)?;
        entry.ime = Some(ime);
        entry.last_seen_ms = now_ms();
        Some(entry.clone())
    }

    /// Apply a profile update (label/color), dropping malformed fields
    /// rather than rejecting the whole update.
    pub fn update_profile(&mut self, client_id: u64, label: Option<String>, color: Option<String>) -> Option<PresenceEntry> {
        let entry = self.entries.get_mut(&client_id)?;
        if let Some(label) = label {
            entry.label = Some(truncate_label(&label));
        }
        if let Some(color) = color {
            if is_valid_color(&color) {
                entry.color = Some(color);
            }
        }
        entry.last_seen_ms = now_ms();
        Some(entry.clone())
    }

    /// Remove every entry whose `last_seen_ms` is older than `idle_ms`,
    /// returning the evicted client ids.
    pub fn evict_idle(&mut self, idle_ms: u64) -> Vec<u64> {
        let now = now_ms();
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_seen_ms) > idle_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }

    /// Apply every transformed op to all tracked cursors, shifting
    /// positions the way the authoritative text shifted.
    pub fn transform_cursors(&mut self, op: &inkwell_protocol::Operation) {
        for entry in self.entries.values_mut() {
            if let Some(cursor) = &mut entry.cursor {
                cursor.position = transform_index(op, cursor.position);
                if let Some(anchor) = &mut cursor.anchor {
                    *anchor = transform_index(op, *anchor);
                }
            }
        }
    }
}

/// Shift a single index the way an applied operation moves every position
/// after it (an insert pushes later positions forward, a delete collapses
/// positions inside its range to its start).
pub fn transform_index(op: &inkwell_protocol::Operation, index: u32) -> u32 {
    use inkwell_protocol::Operation;
    match op {
        Operation::Insert { pos, text } => {
            if index >= *pos {
                index + text.chars().count() as u32
            } else {
                index
            }
        }
        Operation::Delete { pos, len } => {
            if index <= *pos {
                index
            } else if index >= pos + len {
                index - len
            } else {
                *pos
            }
        }
    }
}

/// Build a diff frame, empty if nothing changed.
pub fn diff(added: Vec<PresenceEntry>, updated: Vec<PresenceEntry>, removed: Vec<u64>) -> Option<PresenceDiff> {
    if added.is_empty() && updated.is_empty() && removed.is_empty() {
        None
    } else {
        Some(PresenceDiff { added, updated, removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_clients_are_evicted() {
        let mut reg = PresenceRegistry::default();
        reg.join(1);
        if let Some(entry) = reg.entries.get_mut(&1) {
            entry.last_seen_ms = 0;
        }
        let evicted = reg.evict_idle(60_000);
        assert_eq!(evicted, vec![1]);
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn malformed_profile_fields_are_dropped() {
        let mut reg = PresenceRegistry::default();
        reg.join(1);
        let entry = reg.update_profile(1, Some("ok".into()), Some("not-a-color".into())).unwrap();
        assert_eq!(entry.label.as_deref(), Some("ok"));
        assert_eq!(entry.color, None);
    }

    #[test]
    fn label_is_truncated() {
        let mut reg = PresenceRegistry::default();
        reg.join(1);
        let long = "x".repeat(100);
        let entry = reg.update_profile(1, Some(long), None).unwrap();
        assert_eq!(entry.label.unwrap().chars().count(), inkwell_protocol::MAX_LABEL_LEN);
    }

    #[test]
    fn cursor_transform_follows_insert() {
        use inkwell_protocol::Operation;
        let mut reg = PresenceRegistry::default();
        reg.join(1);
        reg.update_cursor(1, CursorState { position: 3, anchor: None, selection_direction: None });
        reg.transform_cursors(&Operation::Insert { pos: 1, text: "xx".into() });
        let entry = reg.snapshot().into_iter().next().unwrap();
        assert_eq!(entry.cursor.unwrap().position, 5);
    }
}
