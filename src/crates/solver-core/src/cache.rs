//! Cache-manager contract and the composite view over a node's main + extra caches.
//!
//! `solver-core` never implements a cache backend itself — that's the collaborator named in
//! §1's non-goals. What it does own is the bookkeeping for *which* cache managers apply to a
//! given node (§3 "main cache, extra caches") and a uniform way to query "the" cache manager for
//! a node regardless of how many are registered.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::vertex::CacheMap;

/// A cache-manager backend, identified by `id()` (§6 "CacheManager contract").
#[async_trait]
pub trait CacheManager: Send + Sync + 'static {
    /// Stable identifier, used to dedupe a vertex's `cacheSource` against the registry's default.
    fn id(&self) -> &str;

    /// Attempt to load a cached record for the given cache-map description.
    async fn load(&self, record: &CacheMap) -> Result<Option<CacheRecord>>;
}

/// Whatever a [`CacheManager`] hands back on a hit. Left as an opaque blob — interpreting it is
/// the `Op`'s job via [`crate::vertex::Op::load_cache`].
#[derive(Clone, Debug)]
pub struct CacheRecord {
    pub manager_id: String,
    pub payload: Vec<u8>,
}

/// The live combination of a node's main cache manager and any extra caches registered on it
/// (§4.2 "Combined cache manager"). If no extras are registered, behaves exactly like the main
/// cache manager — no wrapper overhead, no behavior change.
pub struct CombinedCacheManager {
    main: Arc<dyn CacheManager>,
    extra: HashMap<String, Arc<dyn CacheManager>>,
}

impl CombinedCacheManager {
    pub fn new(main: Arc<dyn CacheManager>, extra: HashMap<String, Arc<dyn CacheManager>>) -> Self {
        Self { main, extra }
    }

    /// Try the main cache manager first, then each extra cache manager in unspecified order,
    /// returning the first hit.
    pub async fn load(&self, record: &CacheMap) -> Result<Option<CacheRecord>> {
        if let Some(hit) = self.main.load(record).await? {
            return Ok(Some(hit));
        }
        for cache in self.extra.values() {
            if let Some(hit) = cache.load(record).await? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    pub fn main_id(&self) -> &str {
        self.main.id()
    }

    pub fn extra_ids(&self) -> impl Iterator<Item = &str> {
        self.extra.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::ContentDigest;

    struct MockCache {
        id: String,
        hit: Option<Vec<u8>>,
    }

    #[async_trait]
    impl CacheManager for MockCache {
        fn id(&self) -> &str {
            &self.id
        }
        async fn load(&self, _record: &CacheMap) -> Result<Option<CacheRecord>> {
            Ok(self.hit.clone().map(|payload| CacheRecord {
                manager_id: self.id.clone(),
                payload,
            }))
        }
    }

    #[tokio::test]
    async fn falls_back_to_extra_cache_on_main_miss() {
        let main = Arc::new(MockCache {
            id: "main".into(),
            hit: None,
        });
        let mut extra = HashMap::new();
        extra.insert(
            "extra".to_string(),
            Arc::new(MockCache {
                id: "extra".into(),
                hit: Some(vec![1, 2, 3]),
            }) as Arc<dyn CacheManager>,
        );
        let combined = CombinedCacheManager::new(main, extra);
        let record = CacheMap {
            digest: ContentDigest::from_parts("v", &[]),
            deps: vec![],
        };
        let hit = combined.load(&record).await.unwrap().unwrap();
        assert_eq!(hit.manager_id, "extra");
    }

    #[tokio::test]
    async fn main_hit_short_circuits_extra_caches() {
        let main = Arc::new(MockCache {
            id: "main".into(),
            hit: Some(vec![9]),
        });
        let combined = CombinedCacheManager::new(main, HashMap::new());
        let record = CacheMap {
            digest: ContentDigest::from_parts("v", &[]),
            deps: vec![],
        };
        let hit = combined.load(&record).await.unwrap().unwrap();
        assert_eq!(hit.manager_id, "main");
    }
}
