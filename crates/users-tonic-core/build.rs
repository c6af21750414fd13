/// Builds the gRPC client and server code for the `users.proto` definition
/// using `tonic-prost-build`.
///
/// The Protocol Buffer definitions located in the `proto` directory are
/// compiled into Rust modules with gRPC bindings in the crate's `OUT_DIR`.
///
/// # Files and Paths
///
/// - Proto file: `proto/users.proto`
/// - Includes: `proto/`
/// - Descriptor set: `$OUT_DIR/users_descriptor.bin`, consumed by the server's
///   reflection service.
///
/// # Panics
///
/// This function will `panic!` if code generation fails.
///
/// # Output
///
/// Generated code will be accessible in Rust via:
///
/// ```rust
/// pub mod proto {
///     tonic::include_proto!("users.v1");
/// }
/// ```
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("users_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/users.proto"], &["proto"])
        .unwrap();

    println!("cargo:rerun-if-changed=proto/users.proto");
}
