//! [`SubBuilder`]: the indirection handed to a resolved [`Op`](crate::vertex::Op) so it can
//! request further builds without knowing about the registry (§4.4).

use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::CombinedCacheManager;
use crate::context::Context;
use crate::digest::ContentDigest;
use crate::error::Result;
use crate::operation::CachedResult;
use crate::progress::{ClientVertex, ProgressEvent, ProgressFanout};
use crate::registry::RegistryInner;
use crate::vertex::{Backend, ExportableCacheKey, InputEdge, Vertex};

/// Passed into [`Resolver::resolve`](crate::vertex::Resolver::resolve) so the returned `Op` can
/// recurse into the graph (`build`) or run ad-hoc sub-steps with progress reporting (`call`),
/// without ever touching [`Registry`](crate::registry::Registry) directly.
pub struct SubBuilder<B: Backend> {
    registry: Weak<RegistryInner<B>>,
    owner_vertex: Arc<B::Vertex>,
    cache: Arc<CombinedCacheManager>,
    fanout: Arc<ProgressFanout>,
    exporters: Arc<Mutex<Vec<ExportableCacheKey>>>,
}

impl<B: Backend> Clone for SubBuilder<B> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            owner_vertex: Arc::clone(&self.owner_vertex),
            cache: Arc::clone(&self.cache),
            fanout: Arc::clone(&self.fanout),
            exporters: Arc::clone(&self.exporters),
        }
    }
}

impl<B: Backend> SubBuilder<B> {
    pub(crate) fn new(
        registry: Weak<RegistryInner<B>>,
        owner_vertex: Arc<B::Vertex>,
        cache: Arc<CombinedCacheManager>,
        fanout: Arc<ProgressFanout>,
    ) -> Self {
        Self {
            registry,
            owner_vertex,
            cache,
            fanout,
            exporters: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The combined (main + extra) cache manager registered against the owning node, for `Op`
    /// implementations that want to consult it directly.
    pub fn cache_manager(&self) -> Arc<CombinedCacheManager> {
        Arc::clone(&self.cache)
    }

    /// Build a sub-edge, recording its cache key for later export (§4.4).
    pub async fn build(&self, ctx: &Context, edge: InputEdge<B::Vertex>) -> Result<CachedResult<B>> {
        let registry = self
            .registry
            .upgrade()
            .ok_or(crate::error::SolverError::Canceled)?;
        let result = RegistryInner::sub_build(&registry, ctx, edge, Arc::clone(&self.owner_vertex)).await?;
        self.exporters.lock().push(result.cache_key.clone());
        Ok(result)
    }

    /// Run `f` as a synthetic, named sub-step of the owning vertex, with its own started/completed
    /// progress events (§4.4 "call").
    pub async fn call<F, Fut, T>(&self, ctx: &Context, name: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let synthetic_digest = ContentDigest::from_parts(name, &[self.owner_vertex.digest()]);
        self.fanout.broadcast(ProgressEvent::Snapshot(ClientVertex {
            name: name.to_string(),
            digest: synthetic_digest,
            input_digests: vec![self.owner_vertex.digest()],
        }));
        self.fanout.broadcast(ProgressEvent::Started {
            operation: name,
            cached: false,
        });
        let result = f(ctx.clone()).await;
        self.fanout.broadcast(ProgressEvent::Completed {
            operation: name,
            cached: false,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    /// Cache keys accumulated from every `build` call made through this sub-builder so far.
    pub fn exporters(&self) -> Vec<ExportableCacheKey> {
        self.exporters.lock().clone()
    }
}
