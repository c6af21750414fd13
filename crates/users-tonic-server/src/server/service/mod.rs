//! gRPC service implementation.
//!
//! This module contains the client-facing side of the server: it validates
//! that the service is accepting work, hands each RPC to the shared
//! [`UserStore`](users_tonic_core::UserStore), converts results into protobuf
//! messages and `tonic::Status`, and tracks in-flight streams for graceful
//! shutdown.
//!
//! ## Structure
//!
//! - [`handler`] - gRPC service entry point (`UserHandler`).

pub mod handler;
