//! The registry: job lifecycle, graph loading/merging, and GC (§4.1).
//!
//! `Registry<B>` is the single entry point callers hold. Internally it is a thin handle over
//! [`RegistryInner`], which is always reached through an `Arc` (constructed with
//! `Arc::new_cyclic` so states and sub-builders can hold a `Weak` back-reference without the
//! registry ever owning its own children).
//!
//! Locking discipline (§5): the registry-wide `actives`/`jobs` tables use `dashmap`, so most
//! operations only ever hold one shard lock at a time. The one place two locks are live together
//! is the GC cascade, and there the rule is strict: a per-state lock is never held while taking
//! the registry-wide table lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::cache::CacheManager;
use crate::config::RegistryConfig;
use crate::context::Context;
use crate::digest::ContentDigest;
use crate::error::{Result, SolverError};
use crate::job::Job;
use crate::operation::CachedResult;
use crate::progress::progress_channel;
use crate::state::SharedNodeState;
use crate::vertex::{Backend, ExportableCacheKey, InputEdge, Resolver, Vertex, VertexOptions};

pub struct RegistryInner<B: Backend> {
    actives: DashMap<ContentDigest, Arc<SharedNodeState<B>>>,
    jobs: DashMap<String, String>,
    resolver: Arc<dyn Resolver<B>>,
    default_cache: Arc<dyn CacheManager>,
    config: RegistryConfig,
    self_ref: Weak<RegistryInner<B>>,
    job_registered: Notify,
    closed: AtomicBool,
}

impl<B: Backend> RegistryInner<B> {
    /// Locate or create the merged node for `edge.vertex`, recursing into its inputs first
    /// (§4.1 "load"), and wire the caller-supplied back-edge (a job referent or a parent digest).
    fn load(
        self: &Arc<Self>,
        edge: &InputEdge<B::Vertex>,
        memo: &mut HashMap<ContentDigest, Arc<SharedNodeState<B>>>,
    ) -> Arc<SharedNodeState<B>> {
        let vertex = &edge.vertex;
        let own_digest = vertex.digest();
        if let Some(existing) = memo.get(&own_digest) {
            return Arc::clone(existing);
        }

        let options: VertexOptions = vertex.options();
        let effective_digest = if options.ignore_cache {
            own_digest.ignore_cache_variant()
        } else {
            own_digest
        };

        // Input digests are collected (and those children loaded) before the own state is
        // built, so children always exist by the time parent back-edges are wired.
        let mut input_digests = Vec::new();
        let mut child_states = Vec::new();
        for input in vertex.inputs() {
            let child = self.load(&input, memo);
            input_digests.push(child.digest());
            child_states.push(child);
        }

        let state = if let Some(existing) = self.actives.get(&effective_digest) {
            Arc::clone(existing.value())
        } else if !options.ignore_cache {
            // One-way merge rule: a non-ignoring request may adopt an already-built
            // ignore-cache node's state (it's strictly fresher), but never the reverse.
            let adopted = self
                .actives
                .get(&own_digest.ignore_cache_variant())
                .map(|entry| Arc::clone(entry.value()));
            match adopted {
                Some(state) => {
                    self.actives.insert(effective_digest, Arc::clone(&state));
                    state
                }
                None => self.new_state(effective_digest, vertex, &input_digests),
            }
        } else {
            self.new_state(effective_digest, vertex, &input_digests)
        };

        if let Some(source) = options.cache_source {
            // Resolved lazily against whatever cache manager the caller's own default happens to
            // be — extra sources are identified by id only, the manager instance itself is
            // supplied out of band by the same resolver that built this vertex's Op. Here we can
            // only record the id; `Op::load_cache` implementations that need the actual manager
            // look it up through their own resolver-provided handle.
            let _ = source.id;
        }

        for child in &child_states {
            child.add_parent(effective_digest);
            state.add_child(child.digest());
        }

        memo.insert(own_digest, Arc::clone(&state));
        state
    }

    fn new_state(
        self: &Arc<Self>,
        digest: ContentDigest,
        vertex: &Arc<B::Vertex>,
        input_digests: &[ContentDigest],
    ) -> Arc<SharedNodeState<B>> {
        let state = Arc::new(SharedNodeState::new(
            digest,
            Arc::clone(vertex),
            input_digests.to_vec(),
            Arc::clone(&self.resolver),
            Arc::clone(&self.default_cache),
            Weak::clone(&self.self_ref),
        ));
        self.actives.insert(digest, Arc::clone(&state));
        state
    }

    /// Bring one output slot of `edge` to a finished value: compute the cache map, try a cache
    /// hit, otherwise run every input to completion and `exec` (§4.3 orchestration as seen from
    /// the registry side).
    async fn settle(
        self: &Arc<Self>,
        ctx: &Context,
        state: &Arc<SharedNodeState<B>>,
        edge: &InputEdge<B::Vertex>,
    ) -> Result<CachedResult<B>> {
        let op = state.operation();
        let cache_map = op.cache_map(ctx).await?;

        if let Some(hit) = op.load_cache(ctx, cache_map.clone()).await? {
            let output = hit
                .into_iter()
                .nth(edge.index)
                .ok_or_else(|| SolverError::Operation {
                    vertex: edge.vertex.name(),
                    operation: "load_cache",
                    message: format!("no cached output at index {}", edge.index),
                })?;
            let key = ExportableCacheKey {
                digest: cache_map.digest,
                source: state.combined_cache_manager().main_id().to_string(),
            };
            op.record_exported_key(key.clone());
            return Ok(CachedResult {
                output: crate::shared_result::SharedResult::new(output),
                cache_key: key,
            });
        }

        let mut memo = HashMap::new();
        let mut resolved_inputs = Vec::with_capacity(vertex_inputs_len(&edge.vertex));
        for (slot, input) in edge.vertex.inputs().into_iter().enumerate() {
            let child_state = self.load(&input, &mut memo);
            let child_result = Box::pin(self.settle(ctx, &child_state, &input)).await?;
            if self.config.slow_cache_enabled {
                op.calc_slow_cache(ctx, slot, child_result.output.get().clone())
                    .await?;
            }
            resolved_inputs.push(child_result.output.get().clone());
        }

        let outputs = op.exec(ctx, resolved_inputs).await?;
        let output = outputs
            .into_iter()
            .nth(edge.index)
            .ok_or_else(|| SolverError::Operation {
                vertex: edge.vertex.name(),
                operation: "exec",
                message: format!("no output produced at index {}", edge.index),
            })?;
        let key = ExportableCacheKey {
            digest: cache_map.digest,
            source: state.combined_cache_manager().main_id().to_string(),
        };
        op.record_exported_key(key.clone());
        Ok(CachedResult {
            output,
            cache_key: key,
        })
    }

    /// Follow `parents`/`referents` up the graph to find a job with a stake in this node,
    /// guarding against the parent-cycle case with a visited set (§9 Open Question).
    fn session_id(&self, digest: ContentDigest) -> Option<String> {
        let mut visited = HashSet::new();
        self.session_id_inner(digest, &mut visited)
    }

    fn session_id_inner(&self, digest: ContentDigest, visited: &mut HashSet<ContentDigest>) -> Option<String> {
        if !visited.insert(digest) {
            return None;
        }
        let state = self.actives.get(&digest)?;
        let referents = state.referents_snapshot();
        let parents = state.parents_snapshot();
        drop(state);

        for job_id in &referents {
            if let Some(session) = self.jobs.get(job_id) {
                return Some(session.value().clone());
            }
        }
        for parent in parents {
            if let Some(session) = self.session_id_inner(parent, visited) {
                return Some(session);
            }
        }
        None
    }

    /// Remove `digest` from the graph if nothing references it any longer, cascading into its
    /// children (§4.1 "GC cascade").
    fn delete_if_unreferenced(self: &Arc<Self>, digest: ContentDigest, visited: &mut HashSet<ContentDigest>) {
        if !visited.insert(digest) {
            return;
        }
        let Some(state) = self.actives.get(&digest).map(|e| Arc::clone(e.value())) else {
            return;
        };
        if !state.is_unreferenced() {
            return;
        }
        let children = state.children_snapshot();
        self.actives.remove(&digest);
        state.release();
        for child in children {
            if let Some(child_state) = self.actives.get(&child) {
                child_state.remove_parent(digest);
            }
            self.delete_if_unreferenced(child, visited);
        }
    }

    pub(crate) async fn sub_build(
        this: &Arc<Self>,
        ctx: &Context,
        edge: InputEdge<B::Vertex>,
        owner_vertex: Arc<B::Vertex>,
    ) -> Result<CachedResult<B>> {
        let owner_digest = this.effective_digest(&owner_vertex);
        let owner_state = this
            .actives
            .get(&owner_digest)
            .map(|e| Arc::clone(e.value()))
            .ok_or(SolverError::InconsistentParent(owner_digest))?;

        let mut memo = HashMap::new();
        let state = this.load(&edge, &mut memo);
        state.add_parent(owner_digest);
        owner_state.add_child(state.digest());
        this.settle(ctx, &state, &edge).await
    }

    /// The effective digest a vertex is (or would be) keyed under in `actives`: its ignore-cache
    /// variant if the vertex requested it, its own digest otherwise. Mirrors the keying `load`
    /// performs, without the merge/upsert side effects.
    fn effective_digest(&self, vertex: &Arc<B::Vertex>) -> ContentDigest {
        let own_digest = vertex.digest();
        if vertex.options().ignore_cache {
            own_digest.ignore_cache_variant()
        } else {
            own_digest
        }
    }

    /// Load and settle `edge` on behalf of `job_id`, registering the job as a direct referent
    /// of the resulting node and attaching its progress writer to the node's fan-out (§4.1 step
    /// 7, §8 S5).
    pub(crate) async fn job_build(
        this: &Arc<Self>,
        ctx: &Context,
        edge: InputEdge<B::Vertex>,
        job_id: &str,
        writer: &crate::progress::ProgressWriter,
    ) -> Result<(ContentDigest, CachedResult<B>)> {
        let mut memo = HashMap::new();
        let state = this.load(&edge, &mut memo);
        state.add_referent(job_id);
        state.fanout().attach(writer.clone());
        let result = this.settle(ctx, &state, &edge).await?;
        Ok((state.digest(), result))
    }

    /// Drop `job_id`'s referent mark on every node it directly referenced and cascade GC
    /// (§4.5 "discard").
    pub(crate) fn discard_job(this: &Arc<Self>, job_id: &str, built: &HashSet<ContentDigest>) {
        this.jobs.remove(job_id);
        let mut visited = HashSet::new();
        for digest in built {
            if let Some(state) = this.actives.get(digest) {
                state.remove_referent(job_id);
            }
            this.delete_if_unreferenced(*digest, &mut visited);
        }
    }
}

fn vertex_inputs_len<V: Vertex>(vertex: &Arc<V>) -> usize {
    vertex.inputs().len()
}

/// The public handle applications hold. Cheap to clone — it's just an `Arc`.
pub struct Registry<B: Backend>(Arc<RegistryInner<B>>);

impl<B: Backend> Clone for Registry<B> {
    fn clone(&self) -> Self {
        Registry(Arc::clone(&self.0))
    }
}

impl<B: Backend> Registry<B> {
    pub fn new(
        resolver: Arc<dyn Resolver<B>>,
        default_cache: Arc<dyn CacheManager>,
        config: Option<RegistryConfig>,
    ) -> Self {
        let inner = Arc::new_cyclic(|self_ref| RegistryInner {
            actives: DashMap::new(),
            jobs: DashMap::new(),
            resolver,
            default_cache,
            config: config.unwrap_or_default(),
            self_ref: self_ref.clone(),
            job_registered: Notify::new(),
            closed: AtomicBool::new(false),
        });
        Registry(inner)
    }

    /// Register a new job id. Fails if the id is already in use (§4.1 "newJob"), or if the
    /// registry has been `close()`d.
    pub fn new_job(&self, id: impl Into<String>, session_id: impl Into<String>) -> Result<Job<B>> {
        let id = id.into();
        let session_id = session_id.into();
        if self.0.closed.load(Ordering::Acquire) {
            return Err(SolverError::NoSuchJob(id));
        }
        if self.0.jobs.contains_key(&id) {
            return Err(SolverError::DuplicateJob(id));
        }
        self.0.jobs.insert(id.clone(), session_id.clone());
        self.0.job_registered.notify_waiters();
        let (writer, reader) = progress_channel(self.0.config.progress_channel_capacity);
        tracing::debug!(job = %id, "job registered");
        Ok(Job::new(id, session_id, Arc::clone(&self.0), writer, reader))
    }

    /// Wait (up to the configured deadline) for a job id to appear, for callers that only know
    /// the id ahead of time (§4.1 "get").
    ///
    /// Tracked with `tokio::time::Instant` rather than `std::time::Instant` so tests can exercise
    /// the full deadline deterministically under `tokio::time::pause`/`advance`, without a real
    /// wall-clock wait.
    pub async fn get(&self, id: &str) -> Result<String> {
        let deadline = self.0.config.job_lookup_deadline;
        let start = tokio::time::Instant::now();
        loop {
            if let Some(session) = self.0.jobs.get(id) {
                return Ok(session.value().clone());
            }
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(SolverError::NoSuchJob(id.to_string()));
            }
            let _ = tokio::time::timeout(remaining, self.0.job_registered.notified()).await;
        }
    }

    /// Look up the node for `digest`, if one is currently active.
    pub fn lookup(&self, digest: ContentDigest) -> Option<Arc<SharedNodeState<B>>> {
        self.0.actives.get(&digest).map(|e| Arc::clone(e.value()))
    }

    pub fn active_count(&self) -> usize {
        self.0.actives.len()
    }

    pub fn session_id(&self, digest: ContentDigest) -> Option<String> {
        self.0.session_id(digest)
    }

    /// Locate the state for `edge.vertex` and retrieve whatever scheduler edge is installed at
    /// `edge.index`, if any (§4.1 "getEdge").
    pub fn get_edge(&self, edge: &InputEdge<B::Vertex>) -> Result<Option<B::Edge>> {
        Ok(self.edge_state(edge)?.get_edge(edge.index))
    }

    /// Locate the state for `edge.vertex` and install `new_edge` at `edge.index`, releasing
    /// whatever was previously installed there (§4.1/§4.2 "setEdge").
    pub fn set_edge(&self, edge: &InputEdge<B::Vertex>, new_edge: B::Edge) -> Result<()> {
        self.edge_state(edge)?.set_edge(edge.index, new_edge);
        Ok(())
    }

    fn edge_state(&self, edge: &InputEdge<B::Vertex>) -> Result<Arc<SharedNodeState<B>>> {
        let digest = self.0.effective_digest(&edge.vertex);
        self.0
            .actives
            .get(&digest)
            .map(|e| Arc::clone(e.value()))
            .ok_or(SolverError::NoSuchVertex(digest))
    }

    /// Shut the registry down. Does not forcibly discard any job — callers still own that via
    /// `Job::discard` (§4.1 "close"). Subsequent `new_job` calls fail, and any caller still
    /// blocked in `get` wakes and observes `NoSuchJob` once its own deadline is reevaluated.
    pub fn close(&self) {
        self.0.closed.store(true, Ordering::Release);
        self.0.job_registered.notify_waiters();
    }

    pub(crate) fn inner(&self) -> &Arc<RegistryInner<B>> {
        &self.0
    }
}
