//! Bridges the store's push-style stream onto a tonic response stream.

pub mod sink;
