//! # brickflow
//!
//! Core of a chunk-parallel volume processing framework. A large 3D label
//! volume is cut into a grid of chunks, each chunk is fetched from a shared
//! backend store and handed to a pluggable payload by a worker task, and the
//! per-chunk results are stitched back into one globally consistent labeling.
//!
//! ## Building blocks
//!
//! - [`Partitioner`] - splits [`VolumeBounds`] into [`Chunk`]s with a halo.
//! - [`TokenArbiter`] / [`LocalArbiter`] - bounded, FIFO-fair I/O permits per
//!   backend resource, so hundreds of workers never overload one store.
//! - [`ChunkWorker`] - acquires tokens, fetches, runs the [`Payload`] and
//!   produces a [`PartialResult`] with the labels seen on every interior face.
//! - [`Stitcher`] - union-find merge of [`BoundaryContact`]s into a
//!   [`FinalResult`] with a deterministic canonical representative per object.
//! - [`Orchestrator`] - drives a run through its state machine, dispatches
//!   chunks over a bounded worker pool, requeues failures and persists.
//!
//! The token service can also be run remotely (see the
//! `brickflow-tonic-server` crate); [`LocalArbiter`] is the process-local
//! counterpart used for degraded mode and as the server's engine.

mod codec;
mod config;
mod error;
mod geometry;
mod orchestrator;
mod payload;
mod stitch;
mod store;
mod token;
mod volume;
mod worker;

pub use crate::codec::*;
pub use crate::config::*;
pub use crate::error::*;
pub use crate::geometry::*;
pub use crate::orchestrator::*;
pub use crate::payload::*;
pub use crate::stitch::*;
pub use crate::store::*;
pub use crate::token::*;
pub use crate::volume::*;
pub use crate::worker::*;
