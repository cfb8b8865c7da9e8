//! Keyed artifact cache with negative entries.

use std::sync::Arc;

use dashmap::DashMap;

/// Caches the result of loading one artifact per key. A failed or missing
/// load is remembered as `None` so broken artifacts are not re-read on
/// every frame. Racing loads are fine: loading is idempotent and the last
/// writer wins.
pub(crate) struct ArtifactCache<T> {
    entries: DashMap<String, Option<Arc<T>>>,
}

impl<T> Default for ArtifactCache<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> ArtifactCache<T> {
    pub(crate) fn get_or_load(
        &self,
        key: &str,
        load: impl FnOnce() -> Option<T>,
    ) -> Option<Arc<T>> {
        if let Some(cached) = self.entries.get(key) {
            return cached.clone();
        }
        let loaded = load().map(Arc::new);
        self.entries.insert(key.to_owned(), loaded.clone());
        loaded
    }
}
