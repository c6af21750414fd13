#![doc = include_str!("../README.md")]

pub mod common;
pub mod store;

pub use common::*;
pub use store::{StreamMode, StreamOptions, UserSink, UserStore};

/// Generated protobuf messages and gRPC bindings for the `users.v1` package.
pub mod proto {
    tonic::include_proto!("users.v1");

    /// Encoded file descriptor set, registered with the reflection service.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("users_descriptor");
}
