//! Progress fan-out: the per-state multi-writer that broadcasts client-vertex snapshots and
//! start/complete events to every job currently referencing that node (§3 "progress fan-out",
//! §4.1 step 7).
//!
//! Modeled on this codebase's own stream multiplexer: a node's progress is multicast to however
//! many writers are currently attached, late-joining writers are caught up with the current
//! snapshot instead of only seeing future events, and writers are tracked by a witness set so
//! attachment is idempotent.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::digest::ContentDigest;

/// A snapshot of a node's identity, published on attach and on state transitions (§3
/// "client-vertex snapshot").
#[derive(Clone, Debug)]
pub struct ClientVertex {
    pub name: String,
    pub digest: ContentDigest,
    pub input_digests: Vec<ContentDigest>,
}

/// One progress event broadcast to attached writers.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Published immediately on attachment, and again whenever the node's identity changes.
    Snapshot(ClientVertex),
    /// A named operation started on this node (`cached = false` for the real work; see
    /// [`ProgressEvent::Completed`] and §4.3 "Context decoration").
    Started { operation: &'static str, cached: bool },
    /// The matching completion for a prior [`ProgressEvent::Started`]. Always observed after it
    /// on any given writer (§5 "Ordering guarantees").
    Completed {
        operation: &'static str,
        cached: bool,
        error: Option<String>,
    },
}

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

/// A single attached writer's channel handle, tagged with a stable identity so the fan-out's
/// witness set can tell two clones of the same writer apart from two distinct writers.
#[derive(Clone)]
pub struct ProgressWriter {
    id: u64,
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressWriter {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, event: ProgressEvent) {
        let _ = self.tx.try_send(event);
    }
}

/// Multi-writer fan-out for one shared node.
///
/// `attach` is idempotent per writer and immediately replays the current snapshot to a
/// newly-attached writer (§8 S5), so a late-joining job never misses the identity of the node it
/// just attached to.
pub struct ProgressFanout {
    writers: Mutex<Vec<ProgressWriter>>,
    witness: Mutex<HashSet<u64>>,
    snapshot: Mutex<Option<ClientVertex>>,
}

impl ProgressFanout {
    pub fn new() -> Self {
        Self {
            writers: Mutex::new(Vec::new()),
            witness: Mutex::new(HashSet::new()),
            snapshot: Mutex::new(None),
        }
    }

    /// Attach a writer if it isn't already attached, immediately replaying the current snapshot
    /// (if any) to it. Returns `true` if this call actually attached a new writer.
    pub fn attach(&self, writer: ProgressWriter) -> bool {
        {
            let mut witness = self.witness.lock();
            if !witness.insert(writer.id) {
                return false;
            }
        }
        if let Some(snapshot) = self.snapshot.lock().clone() {
            writer.send(ProgressEvent::Snapshot(snapshot));
        }
        self.writers.lock().push(writer);
        true
    }

    /// Detach a writer (e.g. on `Job::discard`).
    pub fn detach(&self, writer: &ProgressWriter) {
        self.witness.lock().remove(&writer.id);
        self.writers.lock().retain(|w| w.id != writer.id);
    }

    pub fn contains(&self, writer: &ProgressWriter) -> bool {
        self.witness.lock().contains(&writer.id)
    }

    /// Publish a new client-vertex snapshot and broadcast it to every attached writer.
    pub fn publish_snapshot(&self, snapshot: ClientVertex) {
        *self.snapshot.lock() = Some(snapshot.clone());
        self.broadcast(ProgressEvent::Snapshot(snapshot));
    }

    pub fn broadcast(&self, event: ProgressEvent) {
        let writers = self.writers.lock();
        for writer in writers.iter() {
            writer.send(event.clone());
        }
    }

    pub fn attached_count(&self) -> usize {
        self.writers.lock().len()
    }
}

impl Default for ProgressFanout {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a fresh progress channel pair: the writer handle attached to shared nodes, and the
/// receiver a job owns to observe its own and its descendants' progress.
pub fn progress_channel(capacity: usize) -> (ProgressWriter, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    let writer = ProgressWriter {
        id: NEXT_WRITER_ID.fetch_add(1, Ordering::SeqCst),
        tx,
    };
    (writer, rx)
}

pub type SharedFanout = Arc<ProgressFanout>;
