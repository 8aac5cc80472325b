//! Error taxonomy for the solver core.
//!
//! Errors are grouped by the semantic categories §7 of the design calls out, not by which
//! component raised them: callers need to know whether a failure is structural (their own
//! misuse of the API), a broken collaborator (resolver/op), or an ordinary operation failure,
//! because that's what determines whether retrying makes sense. The solver core itself never
//! retries — that's the scheduler's job.

use thiserror::Error;

use crate::digest::ContentDigest;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SolverError>;

/// Errors surfaced by the registry, job, and shared-operation APIs.
#[derive(Error, Debug, Clone)]
pub enum SolverError {
    /// A `newJob` call used an id that's already registered.
    #[error("job '{0}' already exists")]
    DuplicateJob(String),

    /// A `get(id)` call's deadline elapsed with no matching job ever appearing.
    #[error("no such job '{0}'")]
    NoSuchJob(String),

    /// The graph loader found a `parent` state that isn't present in `actives`. This can only
    /// happen if the core has a bug: callers never supply a parent digest directly, `load`
    /// always inserts the parent before recursing into its inputs.
    #[error("inconsistent graph: parent {0} not present in active node table")]
    InconsistentParent(ContentDigest),

    /// The caller-supplied [`Resolver`](crate::vertex::Resolver) failed to produce an `Op` for a
    /// vertex. Sticky: every subsequent call against that node's shared operation re-observes
    /// this same error without re-invoking the resolver.
    #[error("resolver failed for vertex '{vertex}': {message}")]
    Resolver { vertex: String, message: String },

    /// A `cacheMap`, `loadCache`, `exec`, or slow-cache computation failed for a reason other
    /// than caller cancellation. Memoized: every future caller for that key observes this error
    /// without re-running the op.
    #[error("operation '{operation}' failed for vertex '{vertex}': {message}")]
    Operation {
        vertex: String,
        operation: &'static str,
        message: String,
    },

    /// The caller's own context/future was canceled while waiting on a single-flighted
    /// operation. Never memoized — the next caller re-executes the underlying work.
    #[error("operation canceled")]
    Canceled,

    /// `setEdge`/`getEdge` named a vertex digest with no active state. Can only happen for a
    /// vertex that was never loaded (or has already been GC'd) — callers are expected to hold
    /// the edge's vertex live across the call.
    #[error("no active state for vertex '{0}'")]
    NoSuchVertex(ContentDigest),
}

impl SolverError {
    /// True for the one variant that must never be memoized (§4.3 "Memoization with
    /// cancellation quarantine").
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SolverError::Canceled)
    }
}
