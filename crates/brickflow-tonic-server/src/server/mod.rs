//! Server-side components of the resource token service.
//!
//! - [`config`] - CLI and environment configuration.
//! - [`service`] - the `ResourceManager` gRPC implementation.
//! - [`telemetry`] - logging and optional OpenTelemetry export.

pub mod config;
pub mod service;
pub mod telemetry;
