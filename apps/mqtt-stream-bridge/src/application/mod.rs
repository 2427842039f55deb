//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the services that multiplex broker topics into
//! stream sessions and the port interfaces they are driven through.

/// Port interfaces for external systems (broker, frame sink).
pub mod ports;

/// Application services: registry, sessions, windowing and the datasource.
pub mod services;
