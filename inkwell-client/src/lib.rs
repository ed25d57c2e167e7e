//! Browser-facing client reconciler, compiled to `cdylib` for wasm-bindgen
//! and as a plain `rlib` for host-side tests.

pub mod pending_store;
pub mod reconciler;

pub use inkwell_protocol::{EditRequest, Operation, ServerFrame};
pub use pending_store::{MemoryPendingStore, PendingStore};
pub use reconciler::{PendingEdit, Reaction, Reconciler};

#[cfg(target_arch = "wasm32")]
mod wasm_bindings {
    use uuid::Uuid;
    use wasm_bindgen::prelude::*;

    use crate::pending_store::LocalStoragePendingStore;
    use crate::reconciler::Reconciler as CoreReconciler;

    /// A thin wasm-bindgen wrapper so a JS editor can drive the reconciler
    /// without touching any Rust generics directly.
    #[wasm_bindgen]
    pub struct JsReconciler {
        inner: CoreReconciler<LocalStoragePendingStore>,
    }

    #[wasm_bindgen]
    impl JsReconciler {
        #[wasm_bindgen(constructor)]
        pub fn new(slug: &str, author_id: &str, text: &str, server_rev: u64) -> Result<JsReconciler, JsValue> {
            console_error_panic_hook::set_once();
            let author_id = Uuid::parse_str(author_id).map_err(|e| JsValue::from_str(&e.to_string()))?;
            let store = LocalStoragePendingStore::new(slug);
            Ok(Self { inner: CoreReconciler::new(author_id, text.to_string(), server_rev, store) })
        }

        pub fn text(&self) -> String {
            self.inner.text().to_string()
        }

        pub fn server_rev(&self) -> u64 {
            self.inner.server_rev()
        }

        /// Call when the editor's text changes locally. Returns the JSON
        /// `EditRequest` to send over the socket, or `undefined` if the new
        /// text is identical to what the reconciler already has.
        pub fn local_edit(&mut self, new_text: &str) -> Option<String> {
            self.inner.local_edit(new_text).map(|req| serde_json::to_string(&req).expect("EditRequest always serializes"))
        }

        /// Call with the JSON body of an `applied` server frame. Returns the
        /// reconciler's new text if it changed, or `undefined` if nothing
        /// visible happened (e.g. it was just our own ack).
        pub fn handle_applied_json(&mut self, json: &str) -> Result<Option<String>, JsValue> {
            #[derive(serde::Deserialize)]
            struct Applied {
                rev: u64,
                op_id: Uuid,
                author_id: Uuid,
                ops: Vec<inkwell_protocol::Operation>,
            }
            let applied: Applied = serde_json::from_str(json).map_err(|e| JsValue::from_str(&e.to_string()))?;
            match self.inner.handle_applied(applied.rev, applied.op_id, applied.author_id, &applied.ops) {
                crate::reconciler::Reaction::TextChanged => Ok(Some(self.inner.text().to_string())),
                crate::reconciler::Reaction::None => Ok(None),
            }
        }

        pub fn handle_rejected(&mut self, op_id: &str) -> Result<(), JsValue> {
            let op_id = Uuid::parse_str(op_id).map_err(|e| JsValue::from_str(&e.to_string()))?;
            self.inner.handle_rejected(op_id);
            Ok(())
        }

        pub fn drift_repair(&mut self, server_text: &str, server_rev: u64) {
            self.inner.drift_repair(server_text.to_string(), server_rev);
        }
    }
}
