//! Consumed vertex/op/resolver/backend traits.
//!
//! `solver-core` is an orchestration layer, not a build-step executor: it does not know how to
//! compute a cache key or run a command. Callers implement [`Vertex`] and [`Op`] for their own
//! node types, bundle them (plus a scheduler-edge handle type) into a [`Backend`] marker, and
//! hand a [`Resolver`] to the [`Registry`](crate::registry::Registry) — the registry does the
//! rest (merging, single-flighting, GC). Bundling the associated types behind one `Backend`
//! parameter (rather than threading `Vertex`/`Op`/`Edge` separately through every type) mirrors
//! how this codebase's own provider-facing traits (`llm::traits::ChatModel` and friends) keep one
//! generic seam rather than several.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::builder::SubBuilder;
use crate::context::Context;
use crate::digest::ContentDigest;
use crate::error::Result;

/// A graph-structural edge: one output slot of a vertex, `(vertex, index)`. This is the `Edge`
/// of §3/§6 used to locate a node and select an output — distinct from the scheduler-level
/// handle type installed via `set_edge`/`get_edge` (see [`Backend::Edge`] / [`SchedulerEdge`]).
#[derive(Clone)]
pub struct InputEdge<V> {
    pub vertex: Arc<V>,
    pub index: usize,
}

impl<V> InputEdge<V> {
    pub fn new(vertex: Arc<V>, index: usize) -> Self {
        Self { vertex, index }
    }
}

impl<V: fmt::Debug> fmt::Debug for InputEdge<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputEdge")
            .field("vertex", &self.vertex)
            .field("index", &self.index)
            .finish()
    }
}

impl<V: Vertex> PartialEq for InputEdge<V> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.vertex.digest() == other.vertex.digest()
    }
}
impl<V: Vertex> Eq for InputEdge<V> {}

/// Optional additional cache manager a vertex wants registered alongside the registry's default
/// one (§3 "main cache, extra caches").
#[derive(Clone)]
pub struct CacheSource {
    pub id: String,
}

/// Per-vertex options that influence identity and caching (§3 "Identity with cache policy").
#[derive(Clone, Default)]
pub struct VertexOptions {
    /// If true, this vertex's request must not reuse a previously-cached, non-ignoring state.
    pub ignore_cache: bool,
    /// An additional cache manager to register against this vertex's merged node.
    pub cache_source: Option<CacheSource>,
}

/// A node descriptor in the build graph, supplied by the caller.
///
/// Implementations are expected to be cheap to clone (typically an `Arc`-wrapped description) and
/// structurally comparable only via [`Vertex::digest`] — the registry never compares vertices by
/// any other means.
pub trait Vertex: Send + Sync + fmt::Debug + 'static {
    /// Content digest identifying this vertex (the `d` of §3), *before* ignore-cache re-keying.
    fn digest(&self) -> ContentDigest;

    /// Ordered input edges. The registry loads each of these (recursively) before this vertex.
    fn inputs(&self) -> Vec<InputEdge<Self>>
    where
        Self: Sized;

    /// Human-readable name, used for tracing spans and progress snapshots.
    fn name(&self) -> String;

    /// Cache policy and extra-cache-source options for this vertex.
    fn options(&self) -> VertexOptions;
}

/// A cache-key description produced by [`Op::cache_map`]. Left opaque to the core: the
/// scheduler and cache-manager collaborators are the ones that interpret it.
#[derive(Clone, Debug, Default)]
pub struct CacheMap {
    pub digest: ContentDigest,
    pub deps: Vec<ContentDigest>,
}

/// A cache key suitable for registration with external cache exporters (§ Glossary
/// "Exportable cache key").
#[derive(Clone, Debug)]
pub struct ExportableCacheKey {
    pub digest: ContentDigest,
    pub source: String,
}

/// The concrete unit of work a resolved [`Op`] produces per output, and what `exec` returns.
pub trait OpOutput: Clone + Send + Sync + fmt::Debug + 'static {}
impl<T: Clone + Send + Sync + fmt::Debug + 'static> OpOutput for T {}

/// The consumed "does the actual work" contract (§6 "Op contract").
///
/// Every method here is invoked at most once concurrently per owning
/// [`SharedOperation`](crate::operation::SharedOperation) — that single-flight discipline is the
/// registry's job, not the implementor's.
#[async_trait]
pub trait Op: Send + Sync + 'static {
    type Output: OpOutput;

    /// Whether this op's vertex was loaded with `ignoreCache`.
    fn ignore_cache(&self) -> bool;

    /// Compute the cache-key description for this vertex.
    async fn cache_map(&self, ctx: &Context) -> Result<CacheMap>;

    /// Attempt to load a previously cached result for the given cache-map record.
    async fn load_cache(&self, ctx: &Context, record: &CacheMap) -> Result<Option<Vec<Self::Output>>>;

    /// Execute the vertex given its (already-resolved) input results. `ctx` is the same
    /// cancellation context passed to the triggering `SharedOperation::exec` call, so a resolved
    /// `Op` that recurses via its `SubBuilder` propagates cancellation correctly.
    async fn exec(&self, ctx: &Context, inputs: Vec<Self::Output>) -> Result<Vec<Self::Output>>;

    /// Compute the content-addressed slow-cache digest for one input slot, given the resolved
    /// result of that input.
    async fn calc_slow_cache(
        &self,
        ctx: &Context,
        index: usize,
        result: &Self::Output,
    ) -> Result<ContentDigest>;
}

/// A scheduler-level handle installed into a node's per-index edge table (§4.2 "Edge handling").
///
/// Lifetime is fully owned by the scheduler collaborator: `retain`/`release` are expected to
/// adjust a reference count the scheduler itself maintains (§9 Open Question on `setEdge`).
/// `solver-core` only ever calls `retain` once per `set_edge` and `release` once per replaced or
/// GC'd edge — it never inspects the count.
pub trait SchedulerEdge: Clone + Send + Sync + 'static {
    fn retain(&self);
    fn release(&self);
}

/// Bundles the vertex/op/scheduler-edge types a single registry instance is monomorphic over,
/// so the rest of the crate only needs one generic parameter.
pub trait Backend: Send + Sync + 'static {
    type Vertex: Vertex;
    type Op: Op;
    type Edge: SchedulerEdge;
}

/// Produces a concrete [`Backend::Op`] for a vertex, given the [`SubBuilder`] that op should use
/// for any recursive builds it performs during its own execution (§4.3 "Lazy operation
/// resolution").
///
/// Invoked at most once per merged node; the result (success or error) is sticky for the life of
/// that node's state.
#[async_trait]
pub trait Resolver<B: Backend>: Send + Sync + 'static {
    async fn resolve(&self, vertex: Arc<B::Vertex>, builder: SubBuilder<B>) -> Result<B::Op>;
}
