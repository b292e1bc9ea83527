#![doc = include_str!("../README.md")]

mod client;
mod common;
pub use client::*;
pub use common::*;
// Public re-export so downstream crates can access `brickflow` via
// `brickflow_tonic_core::brickflow`
pub use brickflow;
