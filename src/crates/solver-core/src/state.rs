//! The merged per-node state shared by every job that resolves to the same digest (§3 "Shared
//! node state", §4.2).
//!
//! One [`SharedNodeState`] exists per distinct effective digest in the registry's active table.
//! It owns the lazily-constructed [`SharedOperation`], the scheduler-edge table, the GC back-edges
//! (`parents`/`children`), the set of jobs currently referencing it (`referents`), and the
//! progress fan-out every attached job observes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::builder::SubBuilder;
use crate::cache::{CacheManager, CombinedCacheManager};
use crate::digest::ContentDigest;
use crate::operation::SharedOperation;
use crate::progress::{ClientVertex, ProgressFanout};
use crate::registry::RegistryInner;
use crate::vertex::{Backend, Resolver, SchedulerEdge, Vertex};

pub struct SharedNodeState<B: Backend> {
    digest: ContentDigest,
    vertex: Arc<B::Vertex>,
    input_digests: Vec<ContentDigest>,
    referents: Mutex<HashSet<String>>,
    parents: Mutex<HashSet<ContentDigest>>,
    children: Mutex<HashSet<ContentDigest>>,
    edges: Mutex<HashMap<usize, B::Edge>>,
    operation: Mutex<Option<Arc<SharedOperation<B>>>>,
    resolver: Arc<dyn Resolver<B>>,
    main_cache: Arc<dyn CacheManager>,
    extra_caches: Mutex<HashMap<String, Arc<dyn CacheManager>>>,
    fanout: Arc<ProgressFanout>,
    registry: Weak<RegistryInner<B>>,
}

impl<B: Backend> SharedNodeState<B> {
    pub(crate) fn new(
        digest: ContentDigest,
        vertex: Arc<B::Vertex>,
        input_digests: Vec<ContentDigest>,
        resolver: Arc<dyn Resolver<B>>,
        main_cache: Arc<dyn CacheManager>,
        registry: Weak<RegistryInner<B>>,
    ) -> Self {
        let fanout = Arc::new(ProgressFanout::new());
        fanout.publish_snapshot(ClientVertex {
            name: vertex.name(),
            digest,
            input_digests: input_digests.clone(),
        });
        Self {
            digest,
            vertex,
            input_digests,
            referents: Mutex::new(HashSet::new()),
            parents: Mutex::new(HashSet::new()),
            children: Mutex::new(HashSet::new()),
            edges: Mutex::new(HashMap::new()),
            operation: Mutex::new(None),
            resolver,
            main_cache,
            extra_caches: Mutex::new(HashMap::new()),
            fanout,
            registry,
        }
    }

    pub fn digest(&self) -> ContentDigest {
        self.digest
    }

    pub fn vertex(&self) -> Arc<B::Vertex> {
        Arc::clone(&self.vertex)
    }

    pub fn fanout(&self) -> Arc<ProgressFanout> {
        Arc::clone(&self.fanout)
    }

    pub fn client_vertex(&self) -> ClientVertex {
        ClientVertex {
            name: self.vertex.name(),
            digest: self.digest,
            input_digests: self.input_digests.clone(),
        }
    }

    // -- referents (jobs) -------------------------------------------------------------------

    pub fn add_referent(&self, job_id: &str) {
        self.referents.lock().insert(job_id.to_string());
    }

    pub fn remove_referent(&self, job_id: &str) {
        self.referents.lock().remove(job_id);
    }

    pub fn referents_snapshot(&self) -> HashSet<String> {
        self.referents.lock().clone()
    }

    // -- parents/children (GC back-edges) ----------------------------------------------------

    pub fn add_parent(&self, parent: ContentDigest) {
        self.parents.lock().insert(parent);
    }

    pub fn remove_parent(&self, parent: ContentDigest) {
        self.parents.lock().remove(&parent);
    }

    pub fn add_child(&self, child: ContentDigest) {
        self.children.lock().insert(child);
    }

    pub fn parents_snapshot(&self) -> Vec<ContentDigest> {
        self.parents.lock().iter().copied().collect()
    }

    pub fn children_snapshot(&self) -> Vec<ContentDigest> {
        self.children.lock().iter().copied().collect()
    }

    /// A node is collectible once nothing — neither a job nor an incoming edge from a still-live
    /// parent — references it (§4.1 "GC cascade").
    pub fn is_unreferenced(&self) -> bool {
        self.referents.lock().is_empty() && self.parents.lock().is_empty()
    }

    // -- extra cache managers -----------------------------------------------------------------

    pub fn register_extra_cache(&self, cache: Arc<dyn CacheManager>) {
        self.extra_caches
            .lock()
            .entry(cache.id().to_string())
            .or_insert(cache);
    }

    pub fn combined_cache_manager(&self) -> Arc<CombinedCacheManager> {
        Arc::new(CombinedCacheManager::new(
            Arc::clone(&self.main_cache),
            self.extra_caches.lock().clone(),
        ))
    }

    // -- scheduler-edge table -----------------------------------------------------------------

    pub fn get_edge(&self, index: usize) -> Option<B::Edge> {
        self.edges.lock().get(&index).cloned()
    }

    /// Install `edge` at `index`, retaining it and releasing whatever was previously installed
    /// there — unconditionally, regardless of how many external references that prior edge still
    /// has (§9 Open Question: `set_edge` always releases the prior edge).
    pub fn set_edge(&self, index: usize, edge: B::Edge) {
        edge.retain();
        let previous = self.edges.lock().insert(index, edge);
        if let Some(previous) = previous {
            previous.release();
        }
    }

    /// Construct the shared operation on first use (§4.3 "lazily constructed, shared by all
    /// edges").
    pub fn operation(&self) -> Arc<SharedOperation<B>> {
        let mut slot = self.operation.lock();
        if let Some(existing) = slot.as_ref() {
            return Arc::clone(existing);
        }
        let sub_builder = SubBuilder::new(
            Weak::clone(&self.registry),
            Arc::clone(&self.vertex),
            self.combined_cache_manager(),
            Arc::clone(&self.fanout),
        );
        let op = Arc::new(SharedOperation::new(
            self.digest,
            Arc::clone(&self.vertex),
            Arc::clone(&self.resolver),
            sub_builder,
            Arc::clone(&self.fanout),
        ));
        *slot = Some(Arc::clone(&op));
        op
    }

    /// Release every installed scheduler edge and drop the shared operation (§4.1 "release on
    /// GC").
    pub fn release(&self) {
        let mut edges = self.edges.lock();
        for (_, edge) in edges.drain() {
            edge.release();
        }
        drop(edges);
        *self.operation.lock() = None;
    }
}
