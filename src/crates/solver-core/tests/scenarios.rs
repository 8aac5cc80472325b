//! End-to-end scenarios from §8 ("Testable properties — end-to-end scenarios").
//!
//! Each test builds a tiny in-memory graph against a mock `Vertex`/`Op`/`Resolver`/
//! `CacheManager` stack and drives it through `Registry`/`Job` exactly as a real frontend would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use solver_core::{
    Backend, CacheManager, CacheMap, CacheRecord, Context, ContentDigest, InputEdge, Op,
    Registry, Resolver, Result as SolverResult, SchedulerEdge, SharedOperation, SubBuilder,
    Vertex, VertexOptions,
};

/// Human-readable tracing output for whoever runs these tests with `RUST_LOG` set. Safe to call
/// from every test — `try_init` no-ops once a subscriber is already installed.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
struct TestVertex {
    name: String,
    digest: ContentDigest,
    inputs: Vec<Arc<TestVertex>>,
    ignore_cache: bool,
}

impl TestVertex {
    fn leaf(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            digest: ContentDigest::from_parts(name, &[]),
            inputs: vec![],
            ignore_cache: false,
        })
    }

    fn with_ignore_cache(self: &Arc<Self>, ignore_cache: bool) -> Arc<Self> {
        Arc::new(Self {
            name: self.name.clone(),
            digest: self.digest,
            inputs: self.inputs.clone(),
            ignore_cache,
        })
    }

    fn parent(name: &str, inputs: Vec<Arc<TestVertex>>) -> Arc<Self> {
        let input_digests: Vec<_> = inputs.iter().map(|v| v.digest()).collect();
        Arc::new(Self {
            name: name.to_string(),
            digest: ContentDigest::from_parts(name, &input_digests),
            inputs,
            ignore_cache: false,
        })
    }
}

impl Vertex for TestVertex {
    fn digest(&self) -> ContentDigest {
        self.digest
    }

    fn inputs(&self) -> Vec<InputEdge<Self>> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(i, v)| InputEdge::new(Arc::clone(v), i))
            .collect()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn options(&self) -> VertexOptions {
        VertexOptions {
            ignore_cache: self.ignore_cache,
            cache_source: None,
        }
    }
}

#[derive(Debug, Clone)]
struct NullEdge;
impl SchedulerEdge for NullEdge {
    fn retain(&self) {}
    fn release(&self) {}
}

struct TestBackend;
impl Backend for TestBackend {
    type Vertex = TestVertex;
    type Op = TestOp;
    type Edge = NullEdge;
}

/// Simple op: no cache hits, `exec` joins the inputs with its own name after an artificial
/// delay (long enough for concurrent callers/tests to interleave against it).
struct TestOp {
    name: String,
    digest: ContentDigest,
    delay: Duration,
    cache_map_calls: Arc<AtomicU32>,
    exec_calls: Arc<AtomicU32>,
    sub_builds: Vec<InputEdge<TestVertex>>,
    builder: SubBuilder<TestBackend>,
}

#[async_trait]
impl Op for TestOp {
    type Output = String;

    fn ignore_cache(&self) -> bool {
        false
    }

    async fn cache_map(&self, _ctx: &Context) -> SolverResult<CacheMap> {
        self.cache_map_calls.fetch_add(1, Ordering::SeqCst);
        Ok(CacheMap {
            digest: self.digest,
            deps: vec![],
        })
    }

    async fn load_cache(
        &self,
        _ctx: &Context,
        _record: &CacheMap,
    ) -> SolverResult<Option<Vec<String>>> {
        Ok(None)
    }

    async fn exec(&self, ctx: &Context, inputs: Vec<String>) -> SolverResult<Vec<String>> {
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut joined = inputs.join(",");
        for edge in &self.sub_builds {
            let sub = self.builder.build(ctx, edge.clone()).await?;
            joined.push(':');
            joined.push_str(sub.output.get());
        }
        Ok(vec![format!("{}[{}]", self.name, joined)])
    }

    async fn calc_slow_cache(
        &self,
        _ctx: &Context,
        _index: usize,
        result: &String,
    ) -> SolverResult<ContentDigest> {
        Ok(ContentDigest::hash(result.as_bytes()))
    }
}

impl Clone for InputEdge<TestVertex> {
    fn clone(&self) -> Self {
        InputEdge::new(Arc::clone(&self.vertex), self.index)
    }
}

/// Shared counters per vertex name, so concurrent builds of the "same" logical vertex (possibly
/// constructed as separate `Arc<TestVertex>` instances with equal digests) are observed to share
/// one underlying op.
#[derive(Default, Clone)]
struct TestResolver {
    calls: Arc<Mutex<HashMap<ContentDigest, (Arc<AtomicU32>, Arc<AtomicU32>)>>>,
    delay: Duration,
    /// Sub-builds only attached to the op resolved for `sub_build_owner` — never to the ops
    /// resolved for the sub-built vertices themselves, or they'd try to sub-build themselves.
    sub_build_owner: Option<ContentDigest>,
    sub_builds: Vec<InputEdge<TestVertex>>,
}

impl TestResolver {
    fn new(delay: Duration) -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            delay,
            sub_build_owner: None,
            sub_builds: vec![],
        }
    }

    fn with_sub_builds(
        delay: Duration,
        owner: ContentDigest,
        sub_builds: Vec<InputEdge<TestVertex>>,
    ) -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            delay,
            sub_build_owner: Some(owner),
            sub_builds,
        }
    }

    fn counters(&self, digest: ContentDigest) -> (Arc<AtomicU32>, Arc<AtomicU32>) {
        self.calls
            .lock()
            .entry(digest)
            .or_insert_with(|| (Arc::new(AtomicU32::new(0)), Arc::new(AtomicU32::new(0))))
            .clone()
    }
}

#[async_trait]
impl Resolver<TestBackend> for TestResolver {
    async fn resolve(
        &self,
        vertex: Arc<TestVertex>,
        builder: SubBuilder<TestBackend>,
    ) -> SolverResult<TestOp> {
        let (cache_map_calls, exec_calls) = self.counters(vertex.digest());
        let sub_builds = if self.sub_build_owner == Some(vertex.digest()) {
            self.sub_builds.clone()
        } else {
            vec![]
        };
        Ok(TestOp {
            name: vertex.name(),
            digest: vertex.digest(),
            delay: self.delay,
            cache_map_calls,
            exec_calls,
            sub_builds,
            builder,
        })
    }
}

struct NullCache;
#[async_trait]
impl CacheManager for NullCache {
    fn id(&self) -> &str {
        "null"
    }
    async fn load(&self, _record: &CacheMap) -> SolverResult<Option<CacheRecord>> {
        Ok(None)
    }
}

fn new_registry(resolver: TestResolver) -> Registry<TestBackend> {
    Registry::new(Arc::new(resolver), Arc::new(NullCache), None)
}

/// S1 — Merge across jobs: two jobs building the same leaf vertex share one node, one `exec`.
#[tokio::test]
async fn s1_merge_across_jobs() {
    init_tracing();
    let resolver = TestResolver::new(Duration::from_millis(20));
    let registry = new_registry(resolver.clone());

    let v = TestVertex::leaf("A");
    let (counters_cache, counters_exec) = resolver.counters(v.digest());

    let job_a = registry.new_job("jobA", "s").unwrap();
    let job_b = registry.new_job("jobB", "s").unwrap();

    let ctx = Context::new();
    let (ra, rb) = tokio::join!(
        job_a.build(&ctx, InputEdge::new(Arc::clone(&v), 0)),
        job_b.build(&ctx, InputEdge::new(Arc::clone(&v), 0)),
    );
    let ra = ra.unwrap();
    let rb = rb.unwrap();
    assert_eq!(ra.output.get(), rb.output.get());
    assert_eq!(registry.active_count(), 1);
    assert_eq!(counters_cache.load(Ordering::SeqCst), 1);
    assert_eq!(counters_exec.load(Ordering::SeqCst), 1);

    let state = registry.lookup(v.digest()).unwrap();
    let referents = state.referents_snapshot();
    assert!(referents.contains("jobA") && referents.contains("jobB"));
}

/// S2 — Ignore-cache keying: order of arrival determines whether the graph merges.
#[tokio::test]
async fn s2_ignore_cache_keying_order_matters() {
    init_tracing();
    // Non-ignoring first, then ignoring: two distinct states.
    {
        let resolver = TestResolver::new(Duration::ZERO);
        let registry = new_registry(resolver);
        let v = TestVertex::leaf("B");
        let v_ignore = v.with_ignore_cache(true);

        let job_a = registry.new_job("jobA", "s").unwrap();
        let job_b = registry.new_job("jobB", "s").unwrap();
        let ctx = Context::new();

        job_a
            .build(&ctx, InputEdge::new(Arc::clone(&v), 0))
            .await
            .unwrap();
        job_b
            .build(&ctx, InputEdge::new(Arc::clone(&v_ignore), 0))
            .await
            .unwrap();

        let plain = registry.lookup(v.digest()).unwrap();
        let ignored = registry.lookup(v.digest().ignore_cache_variant()).unwrap();
        assert!(!Arc::ptr_eq(&plain, &ignored));
    }

    // Ignoring first, then non-ignoring: the non-ignoring build adopts the ignoring state.
    {
        let resolver = TestResolver::new(Duration::ZERO);
        let registry = new_registry(resolver);
        let v = TestVertex::leaf("C");
        let v_ignore = v.with_ignore_cache(true);

        let job_a = registry.new_job("jobA", "s").unwrap();
        let job_b = registry.new_job("jobB", "s").unwrap();
        let ctx = Context::new();

        job_a
            .build(&ctx, InputEdge::new(Arc::clone(&v_ignore), 0))
            .await
            .unwrap();
        job_b
            .build(&ctx, InputEdge::new(Arc::clone(&v), 0))
            .await
            .unwrap();

        let plain = registry.lookup(v.digest()).unwrap();
        let ignored = registry.lookup(v.digest().ignore_cache_variant()).unwrap();
        assert!(Arc::ptr_eq(&plain, &ignored));
    }
}

/// S3 — Cancellation quarantine: canceling one caller never poisons the result for others, and
/// a later caller re-executes rather than observing a phantom cached cancellation.
#[tokio::test]
async fn s3_cancellation_quarantine() {
    init_tracing();
    let resolver = TestResolver::new(Duration::from_millis(60));
    let registry = new_registry(resolver.clone());
    let v = TestVertex::leaf("D");
    let (_, exec_calls) = resolver.counters(v.digest());

    let job_a = registry.new_job("jobA", "s").unwrap();
    let job_b = registry.new_job("jobB", "s").unwrap();

    let ctx_a = Context::new();
    let ctx_a_for_cancel = ctx_a.clone();
    let edge_a = InputEdge::new(Arc::clone(&v), 0);
    let handle_a = tokio::spawn(async move { job_a.build(&ctx_a, edge_a).await });

    let ctx_b = Context::new();
    let job_b = Arc::new(job_b);
    let job_b_clone = Arc::clone(&job_b);
    let edge_b = InputEdge::new(Arc::clone(&v), 0);
    let handle_b = tokio::spawn(async move { job_b_clone.build(&ctx_b, edge_b).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    ctx_a_for_cancel.cancel();

    let result_a = handle_a.await.unwrap();
    assert!(result_a.is_err());

    let result_b = handle_b.await.unwrap();
    assert!(result_b.is_ok());

    assert_eq!(exec_calls.load(Ordering::SeqCst), 1);

    // A fresh job building the same vertex after the flight settles observes the memoized
    // success — the earlier cancellation left no trace.
    let job_c = registry.new_job("jobC", "s").unwrap();
    let ctx_c = Context::new();
    let result_c = job_c
        .build(&ctx_c, InputEdge::new(Arc::clone(&v), 0))
        .await
        .unwrap();
    assert_eq!(exec_calls.load(Ordering::SeqCst), 1);
    assert_eq!(result_c.output.get(), result_b.unwrap().output.get());
}

/// S4 — GC cascade: discarding the only job referencing `P -> C` collects both.
#[tokio::test]
async fn s4_gc_cascade() {
    init_tracing();
    let resolver = TestResolver::new(Duration::ZERO);
    let registry = new_registry(resolver);
    let c = TestVertex::leaf("C");
    let p = TestVertex::parent("P", vec![Arc::clone(&c)]);

    let job_a = registry.new_job("jobA", "s").unwrap();
    let ctx = Context::new();
    job_a
        .build(&ctx, InputEdge::new(Arc::clone(&p), 0))
        .await
        .unwrap();
    assert_eq!(registry.active_count(), 2);

    job_a.discard();
    assert_eq!(registry.active_count(), 0);
}

/// S5 — Progress fan-out on late join: a job attaching to an already-active node immediately
/// observes its current snapshot.
#[tokio::test]
async fn s5_progress_fan_out_late_join() {
    init_tracing();
    let resolver = TestResolver::new(Duration::from_millis(30));
    let registry = new_registry(resolver);
    let c = TestVertex::leaf("C");
    let p = TestVertex::parent("P", vec![Arc::clone(&c)]);

    let job_a = registry.new_job("jobA", "s").unwrap();
    let ctx_a = Context::new();
    let p_for_task = Arc::clone(&p);
    let build_task = tokio::spawn(async move {
        job_a
            .build(&ctx_a, InputEdge::new(p_for_task, 0))
            .await
            .unwrap();
        job_a
    });

    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut job_b = registry.new_job("jobB", "s").unwrap();
    let ctx_b = Context::new();
    job_b
        .build(&ctx_b, InputEdge::new(Arc::clone(&c), 0))
        .await
        .unwrap();

    let first_event = job_b.next_progress_event().await.unwrap();
    match first_event {
        solver_core::ProgressEvent::Snapshot(snapshot) => {
            assert_eq!(snapshot.digest, c.digest());
        }
        other => panic!("expected a snapshot as the first observed event, got {other:?}"),
    }

    let job_a = build_task.await.unwrap();
    job_a.discard();
    job_b.discard();
}

/// S6 — Sub-build exporter accumulation: two sub-builds performed during `exec` both end up in
/// the node's exporter list, in completion order.
#[tokio::test]
async fn s6_sub_build_exporter_accumulation() {
    init_tracing();
    let l1 = TestVertex::leaf("L1");
    let l2 = TestVertex::leaf("L2");
    let sub_edges = vec![
        InputEdge::new(Arc::clone(&l1), 0),
        InputEdge::new(Arc::clone(&l2), 0),
    ];
    let parent = TestVertex::parent("Parent", vec![]);
    let resolver = TestResolver::with_sub_builds(Duration::ZERO, parent.digest(), sub_edges);
    let registry = new_registry(resolver);

    let job = registry.new_job("jobA", "s").unwrap();
    let ctx = Context::new();
    job.build(&ctx, InputEdge::new(Arc::clone(&parent), 0))
        .await
        .unwrap();

    let state = registry.lookup(parent.digest()).unwrap();
    let op: Arc<SharedOperation<TestBackend>> = state.operation();
    let exporters = op.sub_build_exporters();
    assert_eq!(exporters.len(), 2);
    assert_eq!(exporters[0].digest, l1.digest());
    assert_eq!(exporters[1].digest, l2.digest());
}
