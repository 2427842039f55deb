//! HTTP Host Adapter
//!
//! Exposes the datasource to the host platform over HTTP, together with
//! health and Prometheus endpoints for orchestrators and monitoring.
//!
//! # Endpoints
//!
//! - `GET /health` - Broker health check as JSON, 503 when unreachable
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `POST /query` - Batch query, answers with channel addresses
//! - `GET /streams/{*path}` - Server-Sent Events, one JSON frame per event
//! - `GET /metrics` - Prometheus metrics in text format

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::application::ports::ChannelFrameSender;
use crate::application::services::{
    Datasource, QueryDataRequest, SessionError, StreamSession, SubscribeStreamStatus,
};
use crate::infrastructure::metrics::get_metrics_handle;

/// Frames buffered between a session and its SSE client.
const STREAM_BUFFER: usize = 16;

// =============================================================================
// Server
// =============================================================================

/// Shared state for the HTTP handlers.
#[derive(Debug)]
pub struct HttpState {
    datasource: Arc<Datasource>,
    cancel: CancellationToken,
}

impl HttpState {
    /// Create handler state. Streams end when `cancel` fires.
    #[must_use]
    pub const fn new(datasource: Arc<Datasource>, cancel: CancellationToken) -> Self {
        Self { datasource, cancel }
    }
}

/// HTTP server for the host adapter.
pub struct HttpServer {
    port: u16,
    state: Arc<HttpState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub fn new(port: u16, datasource: Arc<Datasource>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state: Arc::new(HttpState::new(datasource, cancel.clone())),
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`HttpServerError`] if binding fails or the server hits a
    /// fatal error.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the router.
pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/query", post(query_handler))
        .route("/streams/{*path}", get(stream_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let result = state.datasource.check_health().await;
    let status = if result.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(result))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn query_handler(
    State(state): State<Arc<HttpState>>,
    Json(request): Json<QueryDataRequest>,
) -> impl IntoResponse {
    Json(state.datasource.query_data(&request))
}

async fn stream_handler(
    State(state): State<Arc<HttpState>>,
    Path(path): Path<String>,
) -> Response {
    match state.datasource.subscribe_stream(&path) {
        SubscribeStreamStatus::Ok => {}
        SubscribeStreamStatus::NotFound => return StatusCode::NOT_FOUND.into_response(),
        SubscribeStreamStatus::PermissionDenied => return StatusCode::FORBIDDEN.into_response(),
    }

    let session = match state.datasource.open_stream(&path).await {
        Ok(session) => session,
        Err(e @ (SessionError::Address(_) | SessionError::InvalidTopic(_))) => {
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
        Err(e @ SessionError::Subscribe(_)) => {
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    let stream = stream_frames(session, state.cancel.child_token(), path);
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Drive an opened session and expose its frames as SSE events.
///
/// Dropping the returned stream cancels the session.
fn stream_frames(
    mut session: StreamSession,
    cancel: CancellationToken,
    path: String,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let (sender, frames) = ChannelFrameSender::new(STREAM_BUFFER);

    let session_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = session.run(session_cancel, &sender).await {
            tracing::warn!(path = %path, error = %e, "stream session ended with error");
        }
    });

    let guard = cancel.drop_guard();
    ReceiverStream::new(frames).filter_map(move |frame| {
        let _cancel_on_drop = &guard;
        let event = match Event::default().json_data(&frame) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode frame");
                None
            }
        };
        std::future::ready(event)
    })
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP server error.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind HTTP server to port {0}: {1}")]
    BindFailed(u16, String),
    /// Server failed while running.
    #[error("HTTP server failed: {0}")]
    ServerFailed(String),
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{BrokerError, MockBrokerClient, QosLevel};

    fn app(broker: MockBrokerClient) -> Router {
        let datasource = Arc::new(Datasource::new("1", Arc::new(broker), QosLevel::AtMostOnce, 16));
        router(Arc::new(HttpState::new(datasource, CancellationToken::new())))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn liveness_is_ok() {
        let response = app(MockBrokerClient::new())
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_broker_state() {
        let mut broker = MockBrokerClient::new();
        broker.expect_connect().returning(|| Ok(()));
        let response = app(broker)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"status": "OK", "message": "Data source is working"})
        );

        let mut broker = MockBrokerClient::new();
        broker.expect_connect().returning(|| {
            Err(BrokerError::Connection {
                message: "refused".to_string(),
            })
        });
        let response = app(broker)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["status"], "ERROR");
    }

    #[tokio::test]
    async fn query_returns_channel_per_ref_id() {
        let body = json!({
            "queries": [
                {"refId": "A", "topic": "top"},
                {"refId": "B", "topic": "top ic"}
            ]
        });
        let response = app(MockBrokerClient::new())
            .oneshot(
                Request::post("/query")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["responses"]["A"]["status"], 200);
        assert_eq!(
            json["responses"]["A"]["frames"][0]["meta"]["channel"],
            "ds/1/topic=top.useInterval=false.includeSchema=false.interval=0s"
        );
        assert_eq!(json["responses"]["B"]["status"], 400);
    }

    #[tokio::test]
    async fn stream_rejects_bad_paths() {
        let response = app(MockBrokerClient::new())
            .oneshot(
                Request::get("/streams/topic=a.useInterval=maybe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app(MockBrokerClient::new())
            .oneshot(Request::get("/streams/useInterval=true").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_opens_event_stream() {
        let mut broker = MockBrokerClient::new();
        broker.expect_subscribe().returning(|_, _, _| Ok(()));
        broker.expect_unsubscribe().returning(|_| Ok(()));

        let response = app(broker)
            .oneshot(
                Request::get("/streams/ds/1/topic=a.useInterval=false.includeSchema=false.interval=0s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );
    }

    #[tokio::test]
    async fn stream_subscribe_failure_is_reported() {
        let mut broker = MockBrokerClient::new();
        broker.expect_subscribe().times(1).returning(|topic, _, _| {
            Err(BrokerError::Subscription {
                topic: topic.to_string(),
                message: "not authorized".to_string(),
            })
        });
        broker.expect_unsubscribe().never();

        let response = app(broker)
            .oneshot(
                Request::get("/streams/topic=denied.useInterval=false.includeSchema=false.interval=0s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("denied"));
    }
}
