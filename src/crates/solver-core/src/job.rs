//! A build job: one caller's session against the registry (§4.5).
//!
//! A `Job` is the unit discard operates on. It owns a progress reader fed by every node it
//! references (directly, or transitively through a merged ancestor's fan-out), and remembers
//! which top-level digests it directly built so `discard` can unwind exactly those references.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::context::Context;
use crate::digest::ContentDigest;
use crate::error::Result;
use crate::operation::CachedResult;
use crate::progress::{ProgressEvent, ProgressWriter};
use crate::registry::RegistryInner;
use crate::vertex::{Backend, InputEdge};

pub struct Job<B: Backend> {
    id: String,
    session_id: String,
    registry: Arc<RegistryInner<B>>,
    writer: ProgressWriter,
    reader: mpsc::Receiver<ProgressEvent>,
    built: Mutex<HashSet<ContentDigest>>,
}

impl<B: Backend> Job<B> {
    pub(crate) fn new(
        id: String,
        session_id: String,
        registry: Arc<RegistryInner<B>>,
        writer: ProgressWriter,
        reader: mpsc::Receiver<ProgressEvent>,
    ) -> Self {
        Self {
            id,
            session_id,
            registry,
            writer,
            reader,
            built: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The session id this job was registered under (§4.5, §6 "Job API" field `sessionID`).
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Receive the next progress event for this job (snapshots and started/completed events
    /// from every node this job references).
    pub async fn next_progress_event(&mut self) -> Option<ProgressEvent> {
        self.reader.recv().await
    }

    /// Build one edge on behalf of this job (§4.1 "build").
    pub async fn build(&self, ctx: &Context, edge: InputEdge<B::Vertex>) -> Result<CachedResult<B>> {
        let (digest, result) =
            RegistryInner::job_build(&self.registry, ctx, edge, &self.id, &self.writer).await?;
        self.built.lock().insert(digest);
        Ok(result)
    }

    /// Run `f` as a synthetic, named sub-step under this job's own progress stream, with
    /// started/completed events bracketing it (§4.4 "call", job-level variant).
    pub async fn call<F, Fut, T>(&self, ctx: &Context, name: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.writer.send(ProgressEvent::Started {
            operation: name,
            cached: false,
        });
        let result = f(ctx.clone()).await;
        self.writer.send(ProgressEvent::Completed {
            operation: name,
            cached: false,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    /// Release every node this job directly built, cascading GC, then close the progress
    /// writer (§9 Open Question: closed outside the registry lock, after the cascade).
    pub fn discard(self) {
        let built = self.built.lock().clone();
        RegistryInner::discard_job(&self.registry, &self.id, &built);
        drop(self.writer);
    }
}
