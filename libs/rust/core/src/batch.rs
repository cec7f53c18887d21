//! Nested batch frames for one logical request.
//!
//! A request owns a [`BatchContext`] and passes it by `&mut` through its call
//! graph. Each nested call site asks for a completion handle; inside a batch
//! frame that handle becomes a child the frame must wait for. `exit` hands the
//! children back so the caller can [`settle`] the handle `enter` returned.
//!
//! ```text
//! ROOT --enter--> IN_BATCH(1) --enter--> IN_BATCH(2) --exit--> IN_BATCH(1) --exit--> ROOT
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures::future::try_join_all;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::metrics_ext::CORE_METRICS;

/// Failure cause carried by a completion handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{cause}")]
pub struct BatchFailure { pub cause: String }

impl BatchFailure {
    pub fn new(cause: impl Into<String>) -> Self { Self { cause: cause.into() } }
}

pub type Outcome = Result<(), BatchFailure>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("exit() without a matching enter()")]
    EmptyFrameStack,
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Single-assignment completion. Clones observe the same outcome.
#[derive(Clone, Debug)]
pub struct CompletionHandle {
    id: u64,
    slot: Arc<watch::Sender<Option<Outcome>>>,
}

impl CompletionHandle {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed), slot: Arc::new(slot) }
    }

    pub fn id(&self) -> u64 { self.id }

    pub fn succeed(&self) -> bool { self.settle(Ok(())) }

    pub fn fail(&self, cause: impl Into<String>) -> bool { self.settle(Err(BatchFailure::new(cause))) }

    /// Stores `outcome` unless one is already set. Returns whether it was stored.
    pub fn settle(&self, outcome: Outcome) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() { return false; }
            *slot = Some(outcome);
            true
        })
    }

    pub fn outcome(&self) -> Option<Outcome> { self.slot.borrow().clone() }

    pub fn is_settled(&self) -> bool { self.slot.borrow().is_some() }

    pub async fn wait(&self) -> Outcome {
        let mut rx = self.slot.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(v) => v.clone().unwrap_or_else(|| Err(BatchFailure::new("completion handle empty"))),
            // unreachable while `self` keeps the sender alive
            Err(_) => Err(BatchFailure::new("completion handle dropped")),
        };
        outcome
    }
}

impl Default for CompletionHandle {
    fn default() -> Self { Self::new() }
}

impl PartialEq for CompletionHandle {
    fn eq(&self, other: &Self) -> bool { self.id == other.id }
}

impl Eq for CompletionHandle {}

/// Remembers the child handle created for one call site so asking twice
/// yields the same handle.
#[derive(Debug, Default)]
pub struct CallSite { handle: Option<CompletionHandle> }

impl CallSite {
    pub fn new() -> Self { Self::default() }
    pub fn handle(&self) -> Option<&CompletionHandle> { self.handle.as_ref() }
}

#[derive(Debug, Default)]
pub struct BatchFrame { pending: Vec<CompletionHandle> }

impl BatchFrame {
    pub fn pending(&self) -> &[CompletionHandle] { &self.pending }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState { Root, InBatch(usize) }

/// Request-scoped frame stack.
#[derive(Debug)]
pub struct BatchContext {
    root: CompletionHandle,
    frames: Vec<BatchFrame>,
}

impl BatchContext {
    pub fn new() -> Self { Self { root: CompletionHandle::new(), frames: Vec::new() } }

    pub fn root(&self) -> &CompletionHandle { &self.root }

    pub fn state(&self) -> BatchState {
        match self.frames.len() { 0 => BatchState::Root, depth => BatchState::InBatch(depth) }
    }

    /// Handle the call at `site` must resolve: its cached child, the root
    /// outside any batch, or a fresh child registered on the top frame.
    pub fn current_handle(&mut self, site: &mut CallSite) -> CompletionHandle {
        if let Some(handle) = &site.handle { return handle.clone(); }
        let Some(frame) = self.frames.last_mut() else { return self.root.clone() };
        let child = CompletionHandle::new();
        frame.pending.push(child.clone());
        site.handle = Some(child.clone());
        CORE_METRICS.batch.parts_total.add(1, &[]);
        child
    }

    /// Opens a frame. The returned handle is what the frame resolves once all
    /// of its children settle.
    pub fn enter(&mut self, site: &mut CallSite) -> CompletionHandle {
        let parent = self.current_handle(site);
        self.frames.push(BatchFrame::default());
        debug!(depth = self.frames.len(), "batch_frame_entered");
        parent
    }

    /// Closes the top frame and returns the children created while it was on top.
    pub fn exit(&mut self) -> Result<Vec<CompletionHandle>, BatchError> {
        let frame = self.frames.pop().ok_or(BatchError::EmptyFrameStack)?;
        debug!(depth = self.frames.len(), children = frame.pending.len(), "batch_frame_exited");
        Ok(frame.pending)
    }
}

impl Default for BatchContext {
    fn default() -> Self { Self::new() }
}

/// Waits for every child (failing on the first failure) and resolves
/// `target` with the result.
pub async fn settle(target: CompletionHandle, children: Vec<CompletionHandle>) -> Outcome {
    let outcome = try_join_all(children.iter().map(CompletionHandle::wait)).await.map(|_| ());
    if let Err(e) = &outcome { debug!(target = target.id(), cause = %e, "batch_frame_failed"); }
    target.settle(outcome.clone());
    outcome
}
