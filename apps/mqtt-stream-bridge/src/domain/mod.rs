//! Domain Layer - Core subscription and frame types.
//!
//! This layer holds the types that describe what a stream session asked for
//! and the columnar frames it produces. Nothing here performs I/O.

/// Broker messages and columnar frame construction.
pub mod streaming;

/// Subscription models, channel addresses and topic validation.
pub mod subscription;
