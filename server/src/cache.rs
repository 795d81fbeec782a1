use async_trait::async_trait;
use dashmap::DashMap;
use kernel::StoredAsset;

use crate::error::CacheError;

/// Receives the cache scopes made stale by a committed upload.
///
/// Invalidation is best effort: callers log a failure and carry on, a stale entry is
/// still valid data until its next refresh.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, scope_keys: &[String]) -> Result<(), CacheError>;
}

/// Cache scope of everything derived from a container's asset list.
#[must_use]
pub fn container_scope(container_id: i64) -> String {
    format!("container_assets-{container_id}")
}

#[derive(Default)]
struct Listing {
    generation: u64,
    assets: Option<Vec<StoredAsset>>,
}

/// In-process cache of container listings served by the API.
///
/// Every invalidation bumps the scope's generation. A listing is only cached when no
/// invalidation happened since it was read, so a read that raced a commit can never
/// outlive that commit's invalidation.
#[derive(Default)]
pub struct ListingCache {
    entries: DashMap<String, Listing>,
}

impl ListingCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, container_id: i64) -> Option<Vec<StoredAsset>> {
        self.entries
            .get(&container_scope(container_id))
            .and_then(|e| e.assets.clone())
    }

    /// Current generation of a container's scope, taken before reading the listing.
    #[must_use]
    pub fn generation(&self, container_id: i64) -> u64 {
        self.entries
            .get(&container_scope(container_id))
            .map_or(0, |e| e.generation)
    }

    /// Caches `assets` read at `generation`. Returns false and caches nothing when the
    /// scope was invalidated in between.
    pub fn put(&self, container_id: i64, generation: u64, assets: Vec<StoredAsset>) -> bool {
        let scope = container_scope(container_id);
        let mut entry = self.entries.entry(scope).or_default();
        if entry.generation != generation {
            tracing::debug!(
                "listing of container {container_id} read at generation {generation}, now {}, not cached",
                entry.generation
            );
            return false;
        }
        entry.assets = Some(assets);
        true
    }

    /// Number of cached listings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.assets.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheInvalidator for ListingCache {
    async fn invalidate(&self, scope_keys: &[String]) -> Result<(), CacheError> {
        for key in scope_keys {
            let mut entry = self.entries.entry(key.clone()).or_default();
            entry.generation += 1;
            if entry.assets.take().is_some() {
                tracing::info!("cache entry {key} invalidated");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalidate_removes_only_named_scopes() {
        // Arrange
        let cache = ListingCache::new();
        cache.put(1, 0, Vec::new());
        cache.put(2, 0, Vec::new());

        // Act
        cache.invalidate(&[container_scope(1)]).await.unwrap();

        // Assert
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_unknown_scope_is_ok() {
        let cache = ListingCache::new();

        let result = cache.invalidate(&[container_scope(42)]).await;

        assert!(result.is_ok());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn listing_read_before_invalidation_is_not_cached() {
        // Arrange
        let cache = ListingCache::new();
        let seen = cache.generation(10);

        // Act
        cache.invalidate(&[container_scope(10)]).await.unwrap();
        let stale = cache.put(10, seen, Vec::new());

        // Assert
        assert!(!stale);
        assert!(cache.get(10).is_none());
        let fresh = cache.generation(10);
        assert!(cache.put(10, fresh, Vec::new()));
        assert!(cache.get(10).is_some());
    }

    #[tokio::test]
    async fn invalidation_after_put_evicts_listing() {
        let cache = ListingCache::new();
        assert!(cache.put(3, cache.generation(3), Vec::new()));

        cache.invalidate(&[container_scope(3)]).await.unwrap();

        assert!(cache.get(3).is_none());
        assert_eq!(cache.generation(3), 1);
    }

    #[test]
    fn scope_key_format() {
        assert_eq!(container_scope(7), "container_assets-7");
    }
}
