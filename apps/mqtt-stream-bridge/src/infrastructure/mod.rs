//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus process-level
//! setup.

/// Configuration loading.
pub mod config;

/// HTTP host adapter, health and metrics endpoints.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// MQTT broker adapter.
pub mod mqtt;

/// Tracing subscriber and OpenTelemetry export.
pub mod telemetry;
