//! Error type for the resource token service.
//!
//! [`Error`] sits between the arbiter and the wire. The server converts
//! `brickflow` errors into it and then into a [`Status`]; the client goes the
//! other way, turning a [`Status`] back into a `brickflow` error whose
//! retryability matches the failure.

use tonic::{Code, Status};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Internal channel failure inside the service.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The client went away before the request completed.
    #[error("Request cancelled by client")]
    RequestCancelled,

    /// The request can never be satisfied.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// No ceiling is configured for the resource.
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// No permits became available within the wait limit.
    #[error("Resource {resource} exhausted after {waited_ms} ms")]
    ResourceExhausted { resource: String, waited_ms: u64 },

    /// The service is shutting down and no longer grants permits.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// The call never reached a healthy service.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<brickflow::Error> for Error {
    fn from(err: brickflow::Error) -> Self {
        match err {
            brickflow::Error::ResourceExhausted {
                resource,
                waited_ms,
            } => Self::ResourceExhausted {
                resource,
                waited_ms,
            },
            brickflow::Error::UnknownResource(resource) => Self::UnknownResource(resource),
            brickflow::Error::InvalidRequest { reason } => Self::InvalidRequest { reason },
            brickflow::Error::Cancelled => Self::RequestCancelled,
            brickflow::Error::ChannelError { context } => Self::ChannelError { context },
            other => Self::ChannelError {
                context: other.to_string(),
            },
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {}", context))
            }
            Error::RequestCancelled => Status::cancelled("Request was cancelled"),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            // The message carries only the resource so clients can rebuild
            // the error.
            Error::UnknownResource(resource) => Status::not_found(resource),
            Error::ResourceExhausted { resource, .. } => Status::resource_exhausted(resource),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
            Error::Transport(message) => Status::unavailable(message),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::InvalidArgument | Code::OutOfRange => Self::InvalidRequest { reason: message },
            Code::NotFound => Self::UnknownResource(message),
            Code::ResourceExhausted => Self::ResourceExhausted {
                resource: message,
                waited_ms: 0,
            },
            Code::Cancelled => Self::RequestCancelled,
            Code::Internal => Self::ChannelError { context: message },
            _ => Self::Transport(format!("{}: {}", status.code(), message)),
        }
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Maps back into the library taxonomy. Anything that may succeed on a
/// later attempt becomes retryable.
impl From<Error> for brickflow::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidRequest { reason } => Self::InvalidRequest { reason },
            Error::UnknownResource(resource) => Self::UnknownResource(resource),
            Error::ResourceExhausted {
                resource,
                waited_ms,
            } => Self::ResourceExhausted {
                resource,
                waited_ms,
            },
            Error::RequestCancelled => Self::Cancelled,
            Error::ChannelError { context } => Self::TransientIo(context),
            Error::ServiceShutdown => Self::TransientIo("token service shutting down".into()),
            Error::Transport(message) => Self::TransientIo(message),
        }
    }
}
