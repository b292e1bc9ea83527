//! gRPC service implementation.
//!
//! - [`handler`] - gRPC service entry point (`ResourceService`).

pub mod handler;
