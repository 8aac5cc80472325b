//! A shared build-graph solver core.
//!
//! # Overview
//!
//! This crate implements the merge/cache/schedule bookkeeping that sits between a build
//! frontend (something that describes a graph of vertices) and a scheduler (something that
//! actually runs steps and tracks reference-counted result handles). It does not run anything
//! itself — it exists to make sure that when two callers ask for the same work, they get back
//! the same in-flight (or memoized) result instead of duplicating it, and that results are
//! garbage-collected the moment nothing references them any more.
//!
//! # Core concepts
//!
//! - A [`vertex::Vertex`] describes one node's identity and inputs. Vertices with the same
//!   content digest (§ [`digest::ContentDigest`]) are merged into a single
//!   [`state::SharedNodeState`], shared by every job that references them.
//! - A [`vertex::Op`] is the resolved, runnable form of a vertex, produced once (and only once)
//!   per merged node by a caller-supplied [`vertex::Resolver`].
//! - Every `Op` method is deduplicated through [`single_flight::SingleFlight`]: N concurrent
//!   callers of the same node's `exec` run it exactly once, and a canceled caller never corrupts
//!   the result seen by the others (§ [`error::SolverError::Canceled`] is never memoized).
//! - [`registry::Registry`] is the entry point: it owns the active-node table, loads and merges
//!   graphs, and runs the GC cascade when the last reference to a node disappears.
//! - A [`job::Job`] is one caller's session: it builds edges, observes progress, and on
//!   [`job::Job::discard`] releases everything it directly referenced.
//!
//! # Quick start
//!
//! ```ignore
//! use solver_core::{Registry, RegistryConfig};
//!
//! let registry = Registry::new(resolver, default_cache, Some(RegistryConfig::default()));
//! let job = registry.new_job("job-1", "session-1")?;
//! let result = job.build(&ctx, edge).await?;
//! job.discard();
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod job;
pub mod operation;
pub mod progress;
pub mod registry;
pub mod shared_result;
pub mod single_flight;
pub mod state;
pub mod vertex;

pub use builder::SubBuilder;
pub use cache::{CacheManager, CacheRecord, CombinedCacheManager};
pub use config::RegistryConfig;
pub use context::Context;
pub use digest::ContentDigest;
pub use error::{Result, SolverError};
pub use job::Job;
pub use operation::{CachedResult, SharedOperation};
pub use progress::{ClientVertex, ProgressEvent, ProgressFanout, ProgressWriter};
pub use registry::Registry;
pub use shared_result::SharedResult;
pub use single_flight::{SingleFlight, SingleFlightError};
pub use state::SharedNodeState;
pub use vertex::{
    Backend, CacheMap, CacheSource, ExportableCacheKey, InputEdge, Op, OpOutput, Resolver,
    SchedulerEdge, Vertex, VertexOptions,
};
