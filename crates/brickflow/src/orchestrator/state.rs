use crate::{ChunkId, Error, PartialResult};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Stage of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RunState {
    #[default]
    Initializing,
    Partitioning,
    Dispatching,
    Collecting,
    Stitching,
    Persisting,
    Completed,
    Failed,
}

impl RunState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// Legal edges of the run state machine.
    ///
    /// `Collecting -> Dispatching` re-enters dispatch for requeued chunks;
    /// `Partitioning -> Stitching` is a resume with every chunk already done.
    pub const fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Initializing, Partitioning)
            | (Partitioning, Dispatching)
            | (Partitioning, Stitching)
            | (Dispatching, Collecting)
            | (Collecting, Dispatching)
            | (Collecting, Stitching)
            | (Stitching, Persisting)
            | (Persisting, Completed) => true,
            _ => false,
        }
    }
}

/// Progress snapshot published while a run executes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunStatus {
    pub state: RunState,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub requeues: u32,
}

impl RunStatus {
    pub const fn total(&self) -> usize {
        self.pending + self.running + self.done + self.failed
    }
}

/// A chunk that could not be processed, with the last error it hit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkFailure {
    pub chunk: ChunkId,
    pub error: Error,
    /// Times the chunk was re-enqueued before giving up.
    pub requeues: u32,
}

/// Terminal failure of a run.
///
/// Carries every partial that completed, so the run can be resumed with
/// [`crate::Orchestrator::resume`] once the cause is fixed.
#[derive(Clone, Debug, thiserror::Error)]
#[error("run failed while {failed_at:?}: {cause}")]
pub struct RunFailure {
    pub failed_at: RunState,
    pub cause: Error,
    pub failed_chunks: Vec<ChunkFailure>,
    pub partials: BTreeMap<ChunkId, PartialResult>,
}

impl RunFailure {
    pub fn failed_ids(&self) -> Vec<ChunkId> {
        self.failed_chunks.iter().map(|f| f.chunk).collect()
    }
}

/// Owns the published [`RunStatus`] and enforces legal transitions.
pub(crate) struct Tracker<'a> {
    tx: &'a watch::Sender<RunStatus>,
}

impl<'a> Tracker<'a> {
    pub(crate) fn start(tx: &'a watch::Sender<RunStatus>) -> Self {
        tx.send_replace(RunStatus::default());
        Self { tx }
    }

    pub(crate) fn state(&self) -> RunState {
        self.tx.borrow().state
    }

    /// Moves to `next`. Illegal transitions are ignored and logged.
    pub(crate) fn enter(&self, next: RunState) {
        self.tx.send_if_modified(|status| {
            if status.state == next {
                return false;
            }
            if !status.state.can_transition_to(next) {
                #[cfg(feature = "tracing")]
                tracing::error!(from = ?status.state, to = ?next, "illegal run transition");
                return false;
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(from = ?status.state, to = ?next, "run transition");
            status.state = next;
            true
        });
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut RunStatus)) {
        self.tx.send_modify(f);
    }

    pub(crate) fn fail(
        &self,
        cause: Error,
        failed_chunks: Vec<ChunkFailure>,
        partials: BTreeMap<ChunkId, PartialResult>,
    ) -> RunFailure {
        let failed_at = self.state();
        self.enter(RunState::Failed);
        #[cfg(feature = "tracing")]
        tracing::error!(?failed_at, error = %cause, failed = failed_chunks.len(), "run failed");
        RunFailure {
            failed_at,
            cause,
            failed_chunks,
            partials,
        }
    }
}
