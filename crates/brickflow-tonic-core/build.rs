//! Compiles `proto/brickflow.proto` into client and server bindings.
//!
//! `protoc` comes from `protoc-bin-vendored`, so no system installation is
//! needed. The encoded file descriptor set is written next to the generated
//! code for the server's reflection service:
//!
//! ```rust,ignore
//! pub mod proto {
//!     tonic::include_proto!("brickflow");
//!     pub const FILE_DESCRIPTOR_SET: &[u8] =
//!         tonic::include_file_descriptor_set!("brickflow_descriptor");
//! }
//! ```
use std::env;
use std::error::Error;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn Error>> {
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    // SAFETY: build scripts are single-threaded at this point.
    unsafe {
        env::set_var("PROTOC", protoc);
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("brickflow_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure().compile_with_config(
        config,
        &["proto/brickflow.proto"],
        &["proto"],
    )?;

    println!("cargo:rerun-if-changed=proto/brickflow.proto");
    Ok(())
}
