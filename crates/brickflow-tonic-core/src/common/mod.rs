//! Protocol bindings and the types shared by client and server.
//!
//! - [`proto`] - generated messages and the `ResourceManager` service.
//! - [`error`] - wire-level error type and its `tonic::Status` mapping.
//! - conversions between the generated messages and `brickflow` types.

mod convert;
pub mod error;

pub use error::*;

pub mod proto {
    tonic::include_proto!("brickflow");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("brickflow_descriptor");
}
