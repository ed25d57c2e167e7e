//! Wire types and the operational-transform engine shared between the
//! inkwell server and client.

pub mod frame;
pub mod ot;
pub mod presence;
pub mod slug;

pub use frame::{AuthOutcome, ClientFrame, EditRequest, ProfileUpdate, RejectReason, ServerFrame, SnapshotFrame};
pub use ot::{apply, diff_to_ops, transform, transform_against_log, AppliedOp, Operation};
pub use presence::{is_valid_color, truncate_label, CursorState, ImeEvent, PresenceDiff, PresenceEntry, Range, SelectionDirection, MAX_LABEL_LEN};
pub use slug::Slug;
