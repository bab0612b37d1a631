//! Gallery (C5): the authoritative in-memory matching index.
//!
//! A single mutex guards only the list pointer; a matching read clones the
//! current `Arc` under the lock and releases it immediately, then runs
//! lock-free against that snapshot. `reload_from_store` builds the new list
//! outside the lock and swaps it in under the lock, so concurrent matchers
//! observe either the full old snapshot or the full new one, never a mix.

use std::sync::{Arc, Mutex};

use tracing::instrument;
use uuid::Uuid;

use crate::codec::IrisTemplate;
use crate::he::HeTemplate;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EyeSide {
    Left,
    Right,
}

#[derive(Clone)]
pub enum GalleryPayload {
    Plain(IrisTemplate),
    He(HeTemplate),
}

#[derive(Clone)]
pub struct GalleryEntry {
    pub identity_id: Uuid,
    pub template_id: Uuid,
    pub identity_name: String,
    pub eye_side: EyeSide,
    pub payload: GalleryPayload,
}

pub struct Gallery<S: Store> {
    entries: Mutex<Arc<Vec<GalleryEntry>>>,
    store: Arc<S>,
    he_ctx: Option<crate::he::HeContext>,
}

impl<S: Store> Gallery<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            entries: Mutex::new(Arc::new(Vec::new())),
            store,
            he_ctx: None,
        }
    }

    pub fn with_he_context(store: Arc<S>, he_ctx: crate::he::HeContext) -> Self {
        Self {
            entries: Mutex::new(Arc::new(Vec::new())),
            store,
            he_ctx: Some(he_ctx),
        }
    }

    /// Snapshot length; does not touch the store.
    pub fn size(&self) -> usize {
        self.entries.lock().expect("gallery lock poisoned").len()
    }

    /// Takes a consistent snapshot of the current entry list. Cheap: this is
    /// an `Arc` clone under a lock held only for the duration of the clone.
    pub fn snapshot(&self) -> Arc<Vec<GalleryEntry>> {
        Arc::clone(&self.entries.lock().expect("gallery lock poisoned"))
    }

    /// Appends a freshly-assigned entry and returns its `template_id`. Does
    /// not persist — callers are responsible for durability (direct store
    /// write or via C4's queue) before or after this call per spec §5's
    /// ordering guarantee (gallery insertion happens-before durability).
    pub fn enroll(
        &self,
        identity_id: Uuid,
        identity_name: String,
        eye_side: EyeSide,
        payload: GalleryPayload,
    ) -> Uuid {
        let template_id = Uuid::new_v4();
        let entry = GalleryEntry {
            identity_id,
            template_id,
            identity_name,
            eye_side,
            payload,
        };
        let mut guard = self.entries.lock().expect("gallery lock poisoned");
        let mut next = (**guard).clone();
        next.push(entry);
        *guard = Arc::new(next);
        template_id
    }

    /// Removes every entry belonging to `identity_id`, returning the count
    /// removed.
    pub fn remove_identity(&self, identity_id: Uuid) -> usize {
        let mut guard = self.entries.lock().expect("gallery lock poisoned");
        let before = guard.len();
        let next: Vec<GalleryEntry> = (**guard)
            .iter()
            .filter(|e| e.identity_id != identity_id)
            .cloned()
            .collect();
        let removed = before - next.len();
        if removed > 0 {
            *guard = Arc::new(next);
        }
        removed
    }

    /// Full reload from the durable store: builds the new list outside the
    /// lock, then swaps it in. Idempotent — calling it twice with no
    /// intervening writes yields identical snapshots.
    #[instrument(skip(self))]
    pub async fn reload_from_store(&self) -> Result<usize, StoreError> {
        let rows = self.store.load_all_templates().await?;
        let next: Vec<GalleryEntry> = rows
            .into_iter()
            .map(|row| crate::store::decode_row(row, self.he_ctx.as_ref()))
            .collect::<Result<_, _>>()?;
        let count = next.len();
        let mut guard = self.entries.lock().expect("gallery lock poisoned");
        *guard = Arc::new(next);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::InMemoryStore;

    fn sample_payload() -> GalleryPayload {
        use crate::codec::CodeGrid;
        GalleryPayload::Plain(IrisTemplate {
            iris_codes: vec![CodeGrid::zeros(4, 6, 2)],
            mask_codes: vec![CodeGrid::zeros(4, 6, 2)],
        })
    }

    #[test]
    fn enroll_then_remove_identity() {
        let store = Arc::new(InMemoryStore::new());
        let gallery = Gallery::new(store);
        let identity_id = Uuid::new_v4();
        gallery.enroll(identity_id, "alice".into(), EyeSide::Left, sample_payload());
        assert_eq!(gallery.size(), 1);
        assert_eq!(gallery.remove_identity(identity_id), 1);
        assert_eq!(gallery.size(), 0);
    }

    #[test]
    fn snapshot_is_stable_across_concurrent_enroll() {
        let store = Arc::new(InMemoryStore::new());
        let gallery = Gallery::new(store);
        gallery.enroll(Uuid::new_v4(), "a".into(), EyeSide::Left, sample_payload());
        let snap = gallery.snapshot();
        gallery.enroll(Uuid::new_v4(), "b".into(), EyeSide::Right, sample_payload());
        assert_eq!(snap.len(), 1, "pre-existing snapshot must not see the later enroll");
        assert_eq!(gallery.size(), 2);
    }
}
