//! Minimal cancellation-bearing context.
//!
//! The design speaks throughout of "a context" propagating cancellation into every
//! registry/op method (§5). Rust has no built-in equivalent of a per-call `context.Context`, so
//! this crate carries a tiny one of its own: a cheaply-clonable handle over a single cancellation
//! flag, with a `cancelled()` future other code can race against. It intentionally does nothing
//! else (no deadlines, no values) — those concerns belong to the scheduler/collaborator layer
//! named in §1's non-goals, not to the solver core.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cancellation signal shared between a caller and whatever the core is doing on its behalf.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`Context::cancel`] has been called (possibly already, before this was
    /// even awaited).
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}
