//! Persistence for the reconciler's pending-edit queue, so a page reload
//! doesn't silently drop edits made while offline.

use crate::reconciler::PendingEdit;

/// Where the reconciler stashes its unacknowledged edits between sessions.
/// An in-memory implementation is enough for tests and for embedders that
/// don't need reload-survival; the `wasm32` target gets a `localStorage`
/// implementation for free.
pub trait PendingStore {
    fn load(&self) -> Option<Vec<PendingEdit>>;
    fn save(&self, pending: Vec<PendingEdit>) -> anyhow::Result<()>;
    fn clear(&self);
}

#[derive(Default)]
pub struct MemoryPendingStore {
    cell: std::cell::RefCell<Option<Vec<PendingEdit>>>,
}

impl PendingStore for MemoryPendingStore {
    fn load(&self) -> Option<Vec<PendingEdit>> {
        self.cell.borrow().clone()
    }

    fn save(&self, pending: Vec<PendingEdit>) -> anyhow::Result<()> {
        *self.cell.borrow_mut() = Some(pending);
        Ok(())
    }

    fn clear(&self) {
        *self.cell.borrow_mut() = None;
    }
}

#[cfg(target_arch = "wasm32")]
pub struct LocalStoragePendingStore {
    key: String,
}

#[cfg(target_arch = "wasm32")]
impl LocalStoragePendingStore {
    pub fn new(slug: &str) -> Self {
        Self { key: format!("inkwell-pending:{slug}") }
    }

    fn storage(&self) -> Option<web_sys::Storage> {
        web_sys::window()?.local_storage().ok().flatten()
    }
}

#[cfg(target_arch = "wasm32")]
impl PendingStore for LocalStoragePendingStore {
    fn load(&self) -> Option<Vec<PendingEdit>> {
        let raw = self.storage()?.get_item(&self.key).ok().flatten()?;
        serde_json::from_str(&raw).ok()
    }

    fn save(&self, pending: Vec<PendingEdit>) -> anyhow::Result<()> {
        let storage = self.storage().ok_or_else(|| anyhow::anyhow!("localStorage unavailable"))?;
        let raw = serde_json::to_string(&pending)?;
        storage.set_item(&self.key, &raw).map_err(|_| anyhow::anyhow!("localStorage.setItem failed"))?;
        Ok(())
    }

    fn clear(&self) {
        if let Some(storage) = self.storage() {
            let _ = storage.remove_item(&self.key);
        }
    }
}
