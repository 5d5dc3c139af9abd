use std::num::NonZeroUsize;

use crate::types::EntityId;

/// Splits `ids` into consecutive windows of at most `batch_size`, preserving
/// order. Yields `ceil(len / batch_size)` windows; none for empty input.
pub fn windows(ids: &[EntityId], batch_size: NonZeroUsize) -> std::slice::Chunks<'_, EntityId> {
    ids.chunks(batch_size.get())
}

/// A sorted, de-duplicated id list to be processed in fixed-size windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    ids: Vec<EntityId>,
    batch_size: NonZeroUsize,
}

impl BatchPlan {
    pub fn new(ids: impl IntoIterator<Item = EntityId>, batch_size: NonZeroUsize) -> Self {
        let mut ids: Vec<EntityId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self { ids, batch_size }
    }

    /// Drops every id `<= last_committed`.
    pub fn resume_after(mut self, last_committed: EntityId) -> Self {
        let start = self.ids.partition_point(|id| *id <= last_committed);
        self.ids.drain(..start);
        self
    }

    /// Keeps only the first `limit` ids.
    pub fn truncate(mut self, limit: usize) -> Self {
        self.ids.truncate(limit);
        self
    }

    /// Windows are derived from the id list on every call, never cached.
    pub fn windows(&self) -> std::slice::Chunks<'_, EntityId> {
        windows(&self.ids, self.batch_size)
    }

    pub fn window_count(&self) -> usize {
        self.ids.len().div_ceil(self.batch_size.get())
    }

    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }
}
