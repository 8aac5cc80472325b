//! Single-flight deduplication primitive (§9 "Single-flight primitive").
//!
//! Collapses concurrent calls under the same key to one underlying execution. Cancellation of
//! one caller never affects another: only when the *last* waiter for a key cancels does the
//! underlying work get aborted. Memoization across separate (non-overlapping) flights is
//! deliberately **not** this primitive's job — §9 is explicit that "memoization is the
//! responsibility of the caller's closure" (that's what [`SharedOperation`](crate::operation::SharedOperation)
//! does on top of this).

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::context::Context;

/// Error shape returned by [`SingleFlight::execute`]: either the underlying work's own error, or
/// a cancellation local to this caller.
#[derive(Debug, Clone)]
pub enum SingleFlightError<E> {
    Upstream(E),
    Canceled,
}

struct Flight<V, E> {
    waiters: AtomicUsize,
    tx: broadcast::Sender<Result<V, E>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A dedup table keyed by `K`, running work that produces `Result<V, E>`.
pub struct SingleFlight<K, V, E> {
    flights: Arc<Mutex<HashMap<K, Arc<Flight<V, E>>>>>,
}

impl<K, V, E> Default for SingleFlight<K, V, E> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V, E> Clone for SingleFlight<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` under single-flight deduplication for `key`, respecting `ctx`'s cancellation.
    ///
    /// `work` is only ever invoked by the first caller to arrive for a given `key`; every
    /// concurrent caller for the same key observes that same invocation's outcome.
    pub async fn execute<F, Fut>(
        &self,
        key: K,
        ctx: &Context,
        work: F,
    ) -> Result<V, SingleFlightError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if ctx.is_cancelled() {
            return Err(SingleFlightError::Canceled);
        }

        let (flight, is_leader) = {
            let mut flights = self.flights.lock();
            if let Some(existing) = flights.get(&key) {
                existing.waiters.fetch_add(1, Ordering::SeqCst);
                (Arc::clone(existing), false)
            } else {
                let (tx, _rx) = broadcast::channel(1);
                let flight = Arc::new(Flight {
                    waiters: AtomicUsize::new(1),
                    tx,
                    handle: Mutex::new(None),
                });
                flights.insert(key.clone(), Arc::clone(&flight));
                (flight, true)
            }
        };

        let mut rx = flight.tx.subscribe();

        if is_leader {
            let flights_table = Arc::clone(&self.flights);
            let flight_for_task = Arc::clone(&flight);
            let key_for_task = key.clone();
            let join = tokio::spawn(async move {
                let result = work().await;
                // Remove this flight before publishing so that late arrivals start a fresh
                // flight instead of racing the tail end of this one.
                let mut flights = flights_table.lock();
                if let Some(current) = flights.get(&key_for_task) {
                    if Arc::ptr_eq(current, &flight_for_task) {
                        flights.remove(&key_for_task);
                    }
                }
                drop(flights);
                // No receivers is not an error here: every waiter that canceled already
                // decremented the count, and the last one to do so aborted this task instead of
                // letting it reach this point.
                let _ = flight_for_task.tx.send(result);
            });
            *flight.handle.lock() = Some(join);
        }

        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                let remaining = flight.waiters.fetch_sub(1, Ordering::SeqCst) - 1;
                if remaining == 0 {
                    if let Some(handle) = flight.handle.lock().take() {
                        handle.abort();
                    }
                    let mut flights = self.flights.lock();
                    if let Some(current) = flights.get(&key) {
                        if Arc::ptr_eq(current, &flight) {
                            flights.remove(&key);
                        }
                    }
                }
                Err(SingleFlightError::Canceled)
            }
            recv = rx.recv() => {
                flight.waiters.fetch_sub(1, Ordering::SeqCst);
                match recv {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(SingleFlightError::Upstream(e)),
                    Err(_closed_or_lagged) => Err(SingleFlightError::Canceled),
                }
            }
        }
    }

    /// Number of distinct keys with an in-flight execution right now. Exposed for tests.
    pub fn in_flight_count(&self) -> usize {
        self.flights.lock().len()
    }
}
