//! Bounded pool of chunk workers.
//!
//! Each worker task owns a capacity-one [`mpsc::Receiver`] and is handed a
//! chunk only while idle, so at most `size` chunks are in flight. Outcomes
//! flow back over one shared channel in completion order.

use crate::{Chunk, ChunkWorker, Error, PartialResult, Payload, Result, TokenArbiter, VolumeStore};
use core::time::Duration;
use std::collections::VecDeque;
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

pub(crate) enum WorkRequest {
    Process { chunk: Chunk },
    Shutdown { response: oneshot::Sender<()> },
}

pub(crate) struct WorkOutcome {
    pub(crate) worker_id: usize,
    pub(crate) chunk: Chunk,
    pub(crate) result: Result<PartialResult>,
}

pub(crate) struct WorkerPool {
    workers: Vec<mpsc::Sender<WorkRequest>>,
    idle: VecDeque<usize>,
    outcomes: mpsc::Receiver<WorkOutcome>,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns `size` workers sharing `worker`'s store, payload and arbiter.
    pub(crate) fn spawn<S, P, A>(
        size: usize,
        worker: &ChunkWorker<S, P, A>,
        cancel: &CancellationToken,
        shutdown_timeout: Duration,
    ) -> Self
    where
        S: VolumeStore,
        P: Payload,
        A: TokenArbiter,
    {
        let size = size.max(1);
        let (outcome_tx, outcomes) = mpsc::channel(size);
        let mut workers = Vec::with_capacity(size);
        for worker_id in 0..size {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(worker_loop(
                worker_id,
                rx,
                outcome_tx.clone(),
                worker.clone(),
                cancel.clone(),
            ));
            workers.push(tx);
        }
        Self {
            workers,
            idle: (0..size).collect(),
            outcomes,
            shutdown_timeout,
        }
    }

    pub(crate) fn has_idle(&self) -> bool {
        !self.idle.is_empty()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.workers.len() - self.idle.len()
    }

    /// Hands `chunk` to an idle worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if no worker is idle or the chosen
    /// worker has exited.
    pub(crate) async fn dispatch(&mut self, chunk: Chunk) -> Result<()> {
        let Some(worker_id) = self.idle.pop_front() else {
            return Err(Error::ChannelError {
                context: "dispatch with no idle worker".to_owned(),
            });
        };
        match self.workers[worker_id].send(WorkRequest::Process { chunk }).await {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::ChannelError {
                context: format!("worker {worker_id} channel closed"),
            }),
        }
    }

    /// Waits for the next finished chunk and marks its worker idle.
    pub(crate) async fn next_outcome(&mut self) -> Option<WorkOutcome> {
        let outcome = self.outcomes.recv().await?;
        self.idle.push_back(outcome.worker_id);
        Some(outcome)
    }

    /// Stops every worker, waiting up to the shutdown timeout for each
    /// acknowledgement.
    pub(crate) async fn shutdown(self) {
        let mut acks = Vec::with_capacity(self.workers.len());
        for (i, worker) in self.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if let Err(_e) = worker.send(WorkRequest::Shutdown { response: tx }).await {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to send shutdown to worker {i}");
            } else {
                acks.push((i, rx));
            }
        }

        let limit = self.shutdown_timeout;
        let waits = acks.into_iter().map(|(_i, rx)| async move {
            match timeout(limit, rx).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Worker {_i} shutdown acknowledged");
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {_i} dropped its shutdown ack: {_e}");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {_i} shutdown timed out");
                }
            }
        });
        futures::future::join_all(waits).await;
    }
}

/// Processes chunks until told to shut down or the pool goes away.
async fn worker_loop<S, P, A>(
    worker_id: usize,
    mut rx: mpsc::Receiver<WorkRequest>,
    outcomes: mpsc::Sender<WorkOutcome>,
    worker: ChunkWorker<S, P, A>,
    cancel: CancellationToken,
) where
    S: VolumeStore,
    P: Payload,
    A: TokenArbiter,
{
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    while let Some(work) = rx.recv().await {
        match work {
            WorkRequest::Process { chunk } => {
                let result = worker.process(&chunk, &cancel).await;
                let outcome = WorkOutcome {
                    worker_id,
                    chunk,
                    result,
                };
                if outcomes.send(outcome).await.is_err() {
                    break;
                }
            }
            WorkRequest::Shutdown { response } => {
                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
}
