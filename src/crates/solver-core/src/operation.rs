//! The shared, single-flighted operation attached to one merged graph node (§4.3 "Lazy operation
//! resolution", "Memoization with cancellation quarantine").
//!
//! A [`SharedOperation`] is created once per [`SharedNodeState`](crate::state::SharedNodeState)
//! and is reused by every job that references that node. Resolving the concrete [`Op`] is sticky
//! (first caller wins, result or error is permanent); each of the four `Op` methods is
//! single-flighted per node so that N concurrent callers of the same merged node run the
//! underlying work exactly once, and a canceled caller never poisons the result for the others.
//!
//! Every public method takes `self: &Arc<Self>` rather than `&self`: the single-flighted closures
//! run inside a detached `tokio::spawn` ([`SingleFlight`]), so they need an owned, `'static`
//! handle back onto this operation rather than a borrow tied to the caller's stack frame.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::Instrument;

use crate::context::Context;
use crate::digest::ContentDigest;
use crate::error::{Result, SolverError};
use crate::progress::{ProgressEvent, ProgressFanout};
use crate::shared_result::SharedResult;
use crate::single_flight::{SingleFlight, SingleFlightError};
use crate::vertex::{Backend, CacheMap, ExportableCacheKey, Op, Resolver, Vertex};

/// The result of bringing one output slot of a merged node to a finished state: the value itself
/// plus the cache key under which it should be registered with external exporters.
pub struct CachedResult<B: Backend> {
    pub output: SharedResult<<B::Op as Op>::Output>,
    pub cache_key: ExportableCacheKey,
}

impl<B: Backend> Clone for CachedResult<B> {
    fn clone(&self) -> Self {
        Self {
            output: self.output.clone(),
            cache_key: self.cache_key.clone(),
        }
    }
}

impl<B: Backend> fmt::Debug for CachedResult<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedResult")
            .field("cache_key", &self.cache_key.digest)
            .finish()
    }
}

/// Single-flight table paired with a memo cell, implementing "memoize success/error, never
/// memoize cancellation" (§4.3) in one place rather than four times over.
struct MemoFlight<K, V> {
    flight: SingleFlight<K, V, SolverError>,
    memo: Mutex<HashMap<K, Result<V>>>,
}

impl<K, V> MemoFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            flight: SingleFlight::new(),
            memo: Mutex::new(HashMap::new()),
        }
    }

    async fn run<F, Fut>(&self, key: K, ctx: &Context, work: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(memoized) = self.memo.lock().get(&key).cloned() {
            return memoized;
        }
        match self.flight.execute(key.clone(), ctx, work).await {
            Ok(value) => {
                self.memo.lock().insert(key, Ok(value.clone()));
                Ok(value)
            }
            Err(SingleFlightError::Upstream(err)) => {
                self.memo.lock().insert(key, Err(err.clone()));
                Err(err)
            }
            // Quarantined: the canceling caller gets the error, nobody else's view of this key
            // is touched.
            Err(SingleFlightError::Canceled) => Err(SolverError::Canceled),
        }
    }
}

/// Owns the sticky resolved [`Op`] and the single-flighted calls against it for one merged node.
pub struct SharedOperation<B: Backend> {
    digest: ContentDigest,
    vertex: Arc<B::Vertex>,
    resolver: Arc<dyn Resolver<B>>,
    sub_builder: crate::builder::SubBuilder<B>,
    resolved: OnceCell<std::result::Result<B::Op, String>>,
    cache_map: MemoFlight<(), CacheMap>,
    load_cache: MemoFlight<(), Option<Vec<<B::Op as Op>::Output>>>,
    exec: MemoFlight<(), Vec<SharedResult<<B::Op as Op>::Output>>>,
    slow_cache: MemoFlight<usize, ContentDigest>,
    fanout: Arc<ProgressFanout>,
    exported_key: Mutex<Option<ExportableCacheKey>>,
}

impl<B: Backend> SharedOperation<B> {
    pub(crate) fn new(
        digest: ContentDigest,
        vertex: Arc<B::Vertex>,
        resolver: Arc<dyn Resolver<B>>,
        sub_builder: crate::builder::SubBuilder<B>,
        fanout: Arc<ProgressFanout>,
    ) -> Self {
        Self {
            digest,
            vertex,
            resolver,
            sub_builder,
            resolved: OnceCell::new(),
            cache_map: MemoFlight::new(),
            load_cache: MemoFlight::new(),
            exec: MemoFlight::new(),
            slow_cache: MemoFlight::new(),
            fanout,
            exported_key: Mutex::new(None),
        }
    }

    /// Resolve the concrete `Op` exactly once. Every later call observes the same success or
    /// the same sticky error (§4.3 "resolver failures are sticky").
    async fn resolve(self: &Arc<Self>) -> Result<()> {
        self.resolved
            .get_or_init(|| async {
                self.resolver
                    .resolve(Arc::clone(&self.vertex), self.sub_builder.clone())
                    .await
                    .map_err(|e| e.to_string())
            })
            .await;
        Ok(())
    }

    fn resolved_op(&self) -> Result<&B::Op> {
        let name = self.vertex.name();
        self.resolved
            .get()
            .expect("resolve() must be awaited before resolved_op()")
            .as_ref()
            .map_err(|message| SolverError::Resolver {
                vertex: name,
                message: message.clone(),
            })
    }

    /// `cache_map()`, single-flighted and memoized across every caller of this node. The leaf
    /// case (a vertex with no inputs is the actual "start evaluation" point, §4.3 "Context
    /// decoration") is decorated with a tracing span and started/completed progress events the
    /// same way `exec` is; non-leaf vertices skip the decoration since a later `exec` covers it.
    pub async fn cache_map(self: &Arc<Self>, ctx: &Context) -> Result<CacheMap> {
        self.resolve().await?;
        let name = self.vertex.name();
        let is_leaf = self.vertex.inputs().is_empty();
        let fanout = Arc::clone(&self.fanout);
        let span = is_leaf.then(|| tracing::info_span!("cache_map", vertex = %name, digest = %self.digest));
        if is_leaf {
            fanout.broadcast(ProgressEvent::Started {
                operation: "cache_map",
                cached: false,
            });
        }
        let this = Arc::clone(self);
        let ctx_owned = ctx.clone();
        let work = move || async move {
            this.resolved_op()?
                .cache_map(&ctx_owned)
                .await
                .map_err(|e| SolverError::Operation {
                    vertex: name,
                    operation: "cache_map",
                    message: e.to_string(),
                })
        };
        let result = match span {
            Some(span) => self.cache_map.run((), ctx, move || work().instrument(span)).await,
            None => self.cache_map.run((), ctx, work).await,
        };
        if is_leaf {
            fanout.broadcast(ProgressEvent::Completed {
                operation: "cache_map",
                cached: false,
                error: result.as_ref().err().map(|e| e.to_string()),
            });
        }
        result
    }

    /// `load_cache(record)`, single-flighted and memoized. Always decorated with started/
    /// completed progress events carrying `cached=true` (§4.3 "Context decoration").
    pub async fn load_cache(
        self: &Arc<Self>,
        ctx: &Context,
        record: CacheMap,
    ) -> Result<Option<Vec<<B::Op as Op>::Output>>> {
        self.resolve().await?;
        let name = self.vertex.name();
        let fanout = Arc::clone(&self.fanout);
        fanout.broadcast(ProgressEvent::Started {
            operation: "load_cache",
            cached: true,
        });
        let this = Arc::clone(self);
        let ctx_owned = ctx.clone();
        let result = self
            .load_cache
            .run((), ctx, move || async move {
                this.resolved_op()?
                    .load_cache(&ctx_owned, &record)
                    .await
                    .map_err(|e| SolverError::Operation {
                        vertex: name,
                        operation: "load_cache",
                        message: e.to_string(),
                    })
            })
            .await;
        fanout.broadcast(ProgressEvent::Completed {
            operation: "load_cache",
            cached: true,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    /// `exec(inputs)`, single-flighted, memoized, decorated with progress events and a tracing
    /// span (§4.3 "Context decoration").
    pub async fn exec(
        self: &Arc<Self>,
        ctx: &Context,
        inputs: Vec<<B::Op as Op>::Output>,
    ) -> Result<Vec<SharedResult<<B::Op as Op>::Output>>> {
        self.resolve().await?;
        let name = self.vertex.name();
        let fanout = Arc::clone(&self.fanout);
        let span = tracing::info_span!("exec", vertex = %name, digest = %self.digest);
        fanout.broadcast(ProgressEvent::Started {
            operation: "exec",
            cached: false,
        });
        let this = Arc::clone(self);
        let ctx_owned = ctx.clone();
        let result = self
            .exec
            .run((), ctx, move || {
                async move {
                    let outputs = this
                        .resolved_op()?
                        .exec(&ctx_owned, inputs)
                        .await
                        .map_err(|e| SolverError::Operation {
                            vertex: name,
                            operation: "exec",
                            message: e.to_string(),
                        })?;
                    Ok(outputs.into_iter().map(SharedResult::new).collect())
                }
                .instrument(span)
            })
            .await;
        fanout.broadcast(ProgressEvent::Completed {
            operation: "exec",
            cached: false,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    /// `calc_slow_cache(index, result)`, single-flighted and memoized per input index.
    pub async fn calc_slow_cache(
        self: &Arc<Self>,
        ctx: &Context,
        index: usize,
        result: <B::Op as Op>::Output,
    ) -> Result<ContentDigest> {
        self.resolve().await?;
        let name = self.vertex.name();
        let this = Arc::clone(self);
        let ctx_owned = ctx.clone();
        self.slow_cache
            .run(index, ctx, move || async move {
                this.resolved_op()?
                    .calc_slow_cache(&ctx_owned, index, &result)
                    .await
                    .map_err(|e| SolverError::Operation {
                        vertex: name,
                        operation: "calc_slow_cache",
                        message: e.to_string(),
                    })
            })
            .await
    }

    /// Cache keys recorded by this node's sub-builder across every recursive `build` performed
    /// from within its resolved `Op`'s `exec` (§8 S6 "sub-build exporter accumulation").
    pub fn sub_build_exporters(&self) -> Vec<ExportableCacheKey> {
        self.sub_builder.exporters()
    }

    /// Record the cache key that should be exported once this node settles (§ Glossary
    /// "Exportable cache key").
    pub(crate) fn record_exported_key(&self, key: ExportableCacheKey) {
        *self.exported_key.lock() = Some(key);
    }

    pub fn exported_key(&self) -> Option<ExportableCacheKey> {
        self.exported_key.lock().clone()
    }

    pub fn digest(&self) -> ContentDigest {
        self.digest
    }

    /// Whether this node's vertex was loaded with `ignoreCache` (§4.3 "read-only accessors").
    pub fn ignore_cache(&self) -> bool {
        self.vertex.options().ignore_cache
    }

    /// The combined (main + extra) cache manager registered against this node (§4.3 "read-only
    /// accessors"). Same instance the node's `SubBuilder` consults for recursive sub-builds.
    pub fn cache(&self) -> Arc<crate::cache::CombinedCacheManager> {
        self.sub_builder.cache_manager()
    }
}
