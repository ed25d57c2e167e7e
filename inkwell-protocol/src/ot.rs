//! The operational-transform engine: pure functions over [`Operation`].
//!
//! Every function here is total — there is no legal pair of operations on a
//! text of any length that makes `transform` panic or return an op that is
//! out of bounds once applied. Positions and lengths are measured in
//! Unicode code points, never UTF-8 bytes, so client and server agree on
//! indices regardless of what's in the text.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single edit against a document, expressed in code-point offsets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Insert { pos: u32, text: String },
    Delete { pos: u32, len: u32 },
}

impl Operation {
    /// Clamp `pos` (and `len` for deletes) against a text of `len` code points.
    /// Transforms can legitimately push an operation past the buffer end, so
    /// out-of-range operations are clamped rather than rejected.
    pub fn clamp(&self, text_len: u32) -> Operation {
        match self {
            Operation::Insert { pos, text } => Operation::Insert {
                pos: (*pos).min(text_len),
                text: text.clone(),
            },
            Operation::Delete { pos, len } => {
                let pos = (*pos).min(text_len);
                let len = (*len).min(text_len.saturating_sub(pos));
                Operation::Delete { pos, len }
            }
        }
    }
}

/// A single applied operation as recorded in a document's operation log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOp {
    pub rev: u64,
    pub op: Operation,
    pub author_id: Uuid,
    pub op_id: Uuid,
    pub ts: u64,
}

/// Apply `op` to `text`, returning the resulting text. `op` is assumed
/// already clamped to `text`'s length; out-of-range indices are clamped
/// defensively here too since callers may skip an explicit clamp step.
pub fn apply(text: &str, op: &Operation) -> String {
    let mut chars: Vec<char> = text.chars().collect();
    match op.clamp(chars.len() as u32) {
        Operation::Insert { pos, text: insert } => {
            let at = pos as usize;
            chars.splice(at..at, insert.chars());
        }
        Operation::Delete { pos, len } => {
            let start = pos as usize;
            let end = (pos + len) as usize;
            chars.splice(start..end, std::iter::empty());
        }
    }
    chars.into_iter().collect()
}

/// Transform `op_a` (the incoming operation, authored by `author_a`) as if
/// it had been issued after `op_b` (authored by `author_b`) was already
/// applied. Ties on equal insertion position are broken by the
/// lexicographic order of the author id — deterministic across replicas,
/// never by wall-clock time.
///
/// Usually returns a single operation, but a delete whose range was
/// straddled by a concurrently-applied insert splits into two deletes (one
/// on each side of the inserted text) to avoid destroying it. The returned
/// ops are in apply order: each is valid against the buffer state left by
/// applying the ones before it.
pub fn transform(op_a: &Operation, author_a: &Uuid, op_b: &Operation, author_b: &Uuid) -> Vec<Operation> {
    match (op_a, op_b) {
        (Operation::Insert { pos: pa, text: ta }, Operation::Insert { pos: pb, text: tb }) => {
            let goes_first = *pa < *pb || (*pa == *pb && author_a < author_b);
            if goes_first {
                vec![Operation::Insert { pos: *pa, text: ta.clone() }]
            } else {
                vec![Operation::Insert {
                    pos: pa + tb.chars().count() as u32,
                    text: ta.clone(),
                }]
            }
        }
        (Operation::Insert { pos: pa, text: ta }, Operation::Delete { pos: pb, len: lb }) => {
            let new_pos = if *pa <= *pb {
                *pa
            } else if *pa >= pb + lb {
                pa - lb
            } else {
                *pb
            };
            vec![Operation::Insert { pos: new_pos, text: ta.clone() }]
        }
        (Operation::Delete { pos: pa, len: la }, Operation::Insert { pos: pb, text: tb }) => {
            let shift = tb.chars().count() as u32;
            if *pb <= *pa {
                vec![Operation::Delete { pos: pa + shift, len: *la }]
            } else if *pb >= pa + la {
                vec![Operation::Delete { pos: *pa, len: *la }]
            } else {
                // The insertion landed inside A's range: split A so the
                // inserted text survives instead of being swallowed. The
                // first delete covers everything before the insertion; the
                // second covers everything after it, its position shifted
                // left by what the first delete already removed.
                let before_len = pb - pa;
                let after_len = la - before_len;
                let mut ops = Vec::with_capacity(2);
                if before_len > 0 {
                    ops.push(Operation::Delete { pos: *pa, len: before_len });
                }
                if after_len > 0 {
                    ops.push(Operation::Delete { pos: pa + shift, len: after_len });
                }
                ops
            }
        }
        (Operation::Delete { pos: pa, len: la }, Operation::Delete { pos: pb, len: lb }) => {
            let (a1, a2) = (*pa, pa + la);
            let (b1, b2) = (*pb, pb + lb);
            if a2 <= b1 {
                // Entirely before B's range.
                vec![Operation::Delete { pos: a1, len: *la }]
            } else if a1 >= b2 {
                // Entirely after B's range: shift left by B's length.
                vec![Operation::Delete { pos: a1 - lb, len: *la }]
            } else {
                // Overlap: remove the intersection from A's range and
                // shift the remainder left by however much of B's range
                // precedes it.
                let overlap_start = a1.max(b1);
                let overlap_end = a2.min(b2);
                let remaining = la.saturating_sub(overlap_end - overlap_start);
                let pos = if a1 >= b1 { b1 } else { a1 };
                vec![Operation::Delete { pos, len: remaining }]
            }
        }
    }
}

/// Fold `op` through every entry of `log` whose `rev > base_rev`, in order,
/// returning the transformed operations ready to apply in sequence at the
/// document's current revision. Usually a single operation; see
/// [`transform`] for when it splits into more.
pub fn transform_against_log(op: Operation, base_rev: u64, log: &[AppliedOp], author_id: &Uuid) -> Vec<Operation> {
    let mut ops = vec![op];
    for applied in log.iter().filter(|a| a.rev > base_rev) {
        ops = ops
            .into_iter()
            .flat_map(|op| transform(&op, author_id, &applied.op, &applied.author_id))
            .collect();
    }
    ops
}

/// Diff `old` against `new`, producing at most one delete and one insert
/// such that `apply(diff_to_ops(old, new), old) == new`. Used by the client
/// reconciler to turn a keystroke-induced text change into wire operations.
pub fn diff_to_ops(old: &str, new: &str) -> Vec<Operation> {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let mut prefix = 0;
    while prefix < old_chars.len()
        && prefix < new_chars.len()
        && old_chars[prefix] == new_chars[prefix]
    {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < old_chars.len() - prefix
        && suffix < new_chars.len() - prefix
        && old_chars[old_chars.len() - 1 - suffix] == new_chars[new_chars.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let removed_len = old_chars.len() - prefix - suffix;
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    let mut ops = Vec::with_capacity(2);
    if removed_len > 0 {
        ops.push(Operation::Delete { pos: prefix as u32, len: removed_len as u32 });
    }
    if !inserted.is_empty() {
        ops.push(Operation::Insert { pos: prefix as u32, text: inserted });
    }
    ops
}
