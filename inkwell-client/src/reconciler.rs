//! The client-side reconciler: turns local text changes into wire edits,
//! tracks what's been sent but not yet acknowledged, and folds remote
//! broadcasts into the local buffer.
//!
//! Mirrors the server's `apply_edit` shape (diff/transform/apply) but runs
//! against a single local buffer instead of a shared document, and keeps
//! its pending queue behind a [`PendingStore`] so a reload doesn't lose
//! in-flight edits.

use std::collections::VecDeque;

use inkwell_protocol::{apply, diff_to_ops, transform, EditRequest, Operation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pending_store::PendingStore;

/// One edit sent to the server but not yet acknowledged by an `applied`
/// frame carrying its `op_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingEdit {
    pub op_id: Uuid,
    pub base_rev: u64,
    pub ops: Vec<Operation>,
}

/// What the caller should do after feeding the reconciler a server frame.
pub enum Reaction {
    /// Nothing externally visible happened (e.g. our own edit was acked).
    None,
    /// The local text changed; the caller should update its editor buffer.
    TextChanged,
}

pub struct Reconciler<S: PendingStore> {
    author_id: Uuid,
    text: String,
    server_rev: u64,
    pending: VecDeque<PendingEdit>,
    store: S,
}

impl<S: PendingStore> Reconciler<S> {
    pub fn new(author_id: Uuid, text: String, server_rev: u64, store: S) -> Self {
        let pending = store.load().unwrap_or_default().into();
        Self { author_id, text, server_rev, pending, store }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn server_rev(&self) -> u64 {
        self.server_rev
    }

    /// Every edit sent but not yet acked, in send order; resend these
    /// verbatim after a reconnect.
    pub fn pending(&self) -> impl Iterator<Item = &PendingEdit> {
        self.pending.iter()
    }

    /// The editor's text changed (keystroke, paste, undo). Diffs against the
    /// reconciler's own copy, builds an `EditRequest` based at the latest
    /// revision this client has seen, and enqueues it for send.
    pub fn local_edit(&mut self, new_text: &str) -> Option<EditRequest> {
        let ops = diff_to_ops(&self.text, new_text);
        if ops.is_empty() {
            return None;
        }
        self.text = new_text.to_string();

        let op_id = Uuid::new_v4();
        self.pending.push_back(PendingEdit { op_id, base_rev: self.server_rev, ops: ops.clone() });
        self.persist();

        Some(EditRequest {
            base_rev: self.server_rev,
            ops,
            author_id: self.author_id,
            op_id,
            cursor_before: None,
            cursor_after: None,
            ts: 0,
        })
    }

    /// An `applied` frame arrived. If it's the ack for our oldest pending
    /// edit, retire it; otherwise it's a remote op, which gets transformed
    /// through every edit we still have in flight before being applied, so
    /// our unacknowledged edits keep their intended effect once they land.
    pub fn handle_applied(&mut self, rev: u64, op_id: Uuid, author_id: Uuid, ops: &[Operation]) -> Reaction {
        self.server_rev = rev;

        if author_id == self.author_id {
            if self.pending.front().is_some_and(|p| p.op_id == op_id) {
                self.pending.pop_front();
                self.persist();
            }
            return Reaction::None;
        }

        let mut changed = false;
        for remote_op in ops {
            let mut remote_ops = vec![remote_op.clone()];
            for pending in &self.pending {
                for local_op in &pending.ops {
                    remote_ops = remote_ops
                        .into_iter()
                        .flat_map(|op| transform(&op, &author_id, local_op, &self.author_id))
                        .collect();
                }
            }
            for op in &remote_ops {
                self.text = apply(&self.text, op);
            }
            changed = true;
        }
        if changed {
            Reaction::TextChanged
        } else {
            Reaction::None
        }
    }

    /// A rejection arrived for `op_id`. The caller is responsible for
    /// deciding whether to retry (e.g. after a `base_too_old` rejection,
    /// call [`Reconciler::drift_repair`] once it has a fresh snapshot).
    pub fn handle_rejected(&mut self, op_id: Uuid) {
        self.pending.retain(|p| p.op_id != op_id);
        self.persist();
    }

    /// Reset local state to a server-provided authoritative snapshot,
    /// discarding the pending queue. Used when a rejection or a reconnect
    /// leaves the client too far behind to transform forward: drift repair
    /// replaces resend once the gap exceeds the transform window.
    pub fn drift_repair(&mut self, server_text: String, server_rev: u64) {
        self.text = server_text;
        self.server_rev = server_rev;
        self.pending.clear();
        self.persist();
    }

    fn persist(&self) {
        let _ = self.store.save(self.pending.iter().cloned().collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending_store::MemoryPendingStore;

    fn uid() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn local_edit_enqueues_and_persists() {
        let author = uid();
        let mut r = Reconciler::new(author, "hello".into(), 0, MemoryPendingStore::default());
        let req = r.local_edit("hello world").unwrap();
        assert_eq!(req.base_rev, 0);
        assert_eq!(r.pending().count(), 1);
    }

    #[test]
    fn own_ack_retires_pending_edit() {
        let author = uid();
        let mut r = Reconciler::new(author, "hello".into(), 0, MemoryPendingStore::default());
        let req = r.local_edit("hello world").unwrap();
        let reaction = r.handle_applied(1, req.op_id, author, &req.ops);
        assert!(matches!(reaction, Reaction::None));
        assert_eq!(r.pending().count(), 0);
        assert_eq!(r.server_rev(), 1);
    }

    #[test]
    fn remote_op_applies_and_shifts_pending_base() {
        let author = uid();
        let remote_author = uid();
        let mut r = Reconciler::new(author, "AB".into(), 0, MemoryPendingStore::default());
        // Local pending insert at position 1, not yet acked.
        let _req = r.local_edit("AXB").unwrap();

        // A remote insert lands at position 0 (rev 1).
        let remote_ops = vec![Operation::Insert { pos: 0, text: "Z".into() }];
        let reaction = r.handle_applied(1, uid(), remote_author, &remote_ops);
        assert!(matches!(reaction, Reaction::TextChanged));
        assert_eq!(r.text(), "ZAXB");
    }

    #[test]
    fn rejection_drops_pending_edit() {
        let author = uid();
        let mut r = Reconciler::new(author, "hello".into(), 0, MemoryPendingStore::default());
        let req = r.local_edit("hello world").unwrap();
        r.handle_rejected(req.op_id);
        assert_eq!(r.pending().count(), 0);
    }

    #[test]
    fn drift_repair_resets_to_server_snapshot() {
        let author = uid();
        let mut r = Reconciler::new(author, "hello".into(), 0, MemoryPendingStore::default());
        let _req = r.local_edit("hello world").unwrap();
        r.drift_repair("server wins".into(), 42);
        assert_eq!(r.text(), "server wins");
        assert_eq!(r.server_rev(), 42);
        assert_eq!(r.pending().count(), 0);
    }
}
