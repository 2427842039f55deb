#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! MQTT Stream Bridge - Topic Multiplexer
//!
//! Subscribes to MQTT topics on behalf of a host platform and streams the
//! messages to live consumers as columnar frames. Each topic is subscribed at
//! the broker once, however many consumers watch it.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Types with no I/O
//!   - `subscription`: topics, subscription models, channel addresses
//!   - `streaming`: timed messages, frames and the frame builder
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: broker connection and frame sink interfaces
//!   - `services`: topic registry, window aggregation, stream sessions and
//!     the host-facing datasource
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `mqtt`: `rumqttc` broker adapter
//!   - `http`: axum host adapter with health and metrics endpoints
//!   - `config`: environment and host settings
//!   - `metrics`, `telemetry`: Prometheus and tracing setup
//!
//! # Data Flow
//!
//! ```text
//!                         +-------------------+     +-----------+
//! MQTT broker --PUBLISH-->| TopicSubscription |---->| session 1 |--frames--> host
//!   (one SUBSCRIBE        |     Registry      |---->| session 2 |--frames--> host
//!    per topic)           +-------------------+     +-----------+
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Domain layer - Core types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// Domain types
pub use domain::streaming::{Column, ColumnValues, Frame, FrameBuilder, FrameMeta, TimedMessage};
pub use domain::subscription::{ChannelAddress, SessionId, SubscriptionModel, Topic};

// Ports
pub use application::ports::{
    BrokerClient, BrokerError, ChannelFrameSender, FrameSender, MessageHandler, QosLevel,
    SendError,
};

// Services
pub use application::services::{
    Datasource, HealthCheckResult, HealthStatus, QueryError, SessionError, StreamSession,
    TopicSubscriptionRegistry, WindowAggregator,
};

// Infrastructure
pub use infrastructure::config::{BridgeConfig, ConfigError, DatasourceSettings};
pub use infrastructure::http::{HttpServer, HttpServerError};
pub use infrastructure::metrics::init_metrics;
pub use infrastructure::mqtt::MqttBroker;
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
