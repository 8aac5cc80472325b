//! Reference-counted wrapper over a concrete `exec` output (§9 "Shared result").
//!
//! Multiple callers of [`SharedOperation::exec`](crate::operation::SharedOperation::exec) can
//! observe the same underlying result without racing each other to release it: each caller holds
//! its own [`SharedResult`] clone, and the wrapped value is only dropped once the last clone
//! goes away.

use std::sync::Arc;

/// A `clone()`-able handle over a `T` produced by a single `exec` invocation.
///
/// This is deliberately just `Arc<T>` under the hood — the teacher codebase reaches for `Arc`
/// rather than hand-rolled refcounting wherever "many owners, one value" shows up, and that's
/// exactly this shape. The newtype exists so call sites read as "a shared exec output", not "an
/// arbitrary Arc".
#[derive(Debug)]
pub struct SharedResult<T>(Arc<T>);

impl<T> SharedResult<T> {
    pub fn new(value: T) -> Self {
        SharedResult(Arc::new(value))
    }

    pub fn get(&self) -> &T {
        &self.0
    }

    /// Number of outstanding clones, including this one. Only meaningful for diagnostics — the
    /// value itself is dropped automatically once this reaches zero.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl<T> Clone for SharedResult<T> {
    fn clone(&self) -> Self {
        SharedResult(Arc::clone(&self.0))
    }
}
