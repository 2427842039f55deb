//! Prometheus Metrics Module
//!
//! Exposes bridge metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Messages**: broker messages received per topic filter and dropped per
//!   slow session
//! - **Frames**: frames delivered to and failed towards the host
//! - **Subscriptions**: active broker topic subscriptions and broker
//!   subscribe/unsubscribe outcomes
//! - **Sessions**: live stream sessions
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, once per process.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "mqtt_bridge_messages_received_total",
        "Total broker messages received per topic filter"
    );
    describe_counter!(
        "mqtt_bridge_messages_dropped_total",
        "Total messages dropped because a session queue was full"
    );

    describe_counter!(
        "mqtt_bridge_frames_sent_total",
        "Total frames delivered to the host"
    );
    describe_counter!(
        "mqtt_bridge_frames_failed_total",
        "Total frames the host did not accept"
    );
    describe_histogram!(
        "mqtt_bridge_frame_rows",
        "Rows per emitted frame"
    );

    describe_gauge!(
        "mqtt_bridge_topic_subscriptions",
        "Number of topics currently subscribed at the broker"
    );
    describe_counter!(
        "mqtt_bridge_broker_requests_total",
        "Broker subscribe and unsubscribe requests by outcome"
    );

    describe_gauge!(
        "mqtt_bridge_sessions",
        "Number of live stream sessions"
    );
    describe_histogram!(
        "mqtt_bridge_session_duration_seconds",
        "Lifetime of stream sessions"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Broker request kind label.
#[derive(Debug, Clone, Copy)]
pub enum BrokerRequest {
    /// SUBSCRIBE.
    Subscribe,
    /// UNSUBSCRIBE.
    Unsubscribe,
}

impl BrokerRequest {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Record a message received on a subscribed topic filter.
pub fn record_message_received(topic: &str) {
    counter!(
        "mqtt_bridge_messages_received_total",
        "topic" => topic.to_string()
    )
    .increment(1);
}

/// Record a message dropped for one session.
pub fn record_message_dropped(topic: &str) {
    counter!(
        "mqtt_bridge_messages_dropped_total",
        "topic" => topic.to_string()
    )
    .increment(1);
}

/// Record a frame delivered to the host.
#[allow(clippy::cast_precision_loss)]
pub fn record_frame_sent(rows: usize) {
    counter!("mqtt_bridge_frames_sent_total").increment(1);
    histogram!("mqtt_bridge_frame_rows").record(rows as f64);
}

/// Record a frame the host did not accept.
pub fn record_frame_failed() {
    counter!("mqtt_bridge_frames_failed_total").increment(1);
}

/// Update the number of topics subscribed at the broker.
#[allow(clippy::cast_precision_loss)]
pub fn set_topic_subscriptions(count: usize) {
    gauge!("mqtt_bridge_topic_subscriptions").set(count as f64);
}

/// Record the outcome of a broker request.
pub fn record_broker_request(request: BrokerRequest, success: bool) {
    counter!(
        "mqtt_bridge_broker_requests_total",
        "request" => request.as_str(),
        "outcome" => if success { "ok" } else { "error" }
    )
    .increment(1);
}

/// Record a stream session starting.
pub fn session_opened() {
    gauge!("mqtt_bridge_sessions").increment(1.0);
}

/// Record a stream session ending.
pub fn session_closed(lifetime: Duration) {
    gauge!("mqtt_bridge_sessions").decrement(1.0);
    histogram!("mqtt_bridge_session_duration_seconds").record(lifetime.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
