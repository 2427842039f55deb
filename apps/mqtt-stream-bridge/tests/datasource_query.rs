//! Datasource Integration Tests
//!
//! Query validation, channel addresses and health checks.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::json;
use test_case::test_case;

use common::FakeBroker;
use mqtt_stream_bridge::application::services::{QueryDataRequest, SubscribeStreamStatus};
use mqtt_stream_bridge::{BrokerClient, Datasource, HealthStatus, QosLevel, SubscriptionModel};

fn datasource(broker: &Arc<FakeBroker>) -> Datasource {
    Datasource::new(
        "1",
        Arc::clone(broker) as Arc<dyn BrokerClient>,
        QosLevel::AtMostOnce,
        16,
    )
}

fn request(queries: serde_json::Value) -> QueryDataRequest {
    serde_json::from_value(json!({ "queries": queries })).unwrap()
}

#[test_case(json!({"refId": "A", "topic": "top"}), "ds/1/topic=top.useInterval=false.includeSchema=false.interval=0s" ; "defaults")]
#[test_case(json!({"refId": "A", "topic": "08:08"}), "ds/1/topic=08:08.useInterval=false.includeSchema=false.interval=0s" ; "colon topic")]
#[test_case(json!({"refId": "A", "topic": "a/+/c", "useInterval": true, "includeSchema": true, "interval": "500ms"}), "ds/1/topic=a/+/c.useInterval=true.includeSchema=true.interval=500ms" ; "windowed")]
fn test_query_mints_channel(query: serde_json::Value, channel: &str) {
    let broker = FakeBroker::new();
    let response = datasource(&broker).query_data(&request(json!([query])));

    let answer = &response.responses["A"];
    assert!(answer.error.is_none());
    assert_eq!(answer.frames.len(), 1);
    assert_eq!(answer.frames[0].row_count(), 0);
    assert_eq!(answer.frames[0].meta.channel.as_deref(), Some(channel));

    let path = channel.strip_prefix("ds/1/").unwrap();
    let model = SubscriptionModel::from_path(path).unwrap();
    assert_eq!(model.to_path(), path);
}

#[test]
fn test_queries_are_answered_independently() {
    let broker = FakeBroker::new();
    let response = datasource(&broker).query_data(&request(json!([
        {"refId": "good", "topic": "x"},
        {"refId": "space", "topic": "top ic"},
        {"refId": "empty", "topic": ""},
        {"refId": "typed", "topic": 7}
    ])));

    assert!(response.responses["good"].error.is_none());
    for bad in ["space", "empty", "typed"] {
        let answer = &response.responses[bad];
        assert!(answer.frames.is_empty(), "{bad} should have no frames");
        assert!(answer.error.is_some(), "{bad} should carry an error");
    }
    assert_eq!(broker.subscribe_count(), 0);
}

#[tokio::test]
async fn test_health_follows_broker_connect() {
    let broker = FakeBroker::new();
    let datasource = datasource(&broker);

    let healthy = datasource.check_health().await;
    assert_eq!(healthy.status, HealthStatus::Ok);
    assert_eq!(healthy.message, "Data source is working");

    broker.fail_connect.store(true, Ordering::SeqCst);
    let unhealthy = datasource.check_health().await;
    assert_eq!(unhealthy.status, HealthStatus::Error);
    assert!(unhealthy.message.contains("connection refused"));
    assert_eq!(broker.connects.load(Ordering::SeqCst), 2);
}

#[test]
fn test_streams_open_but_never_accept_publishes() {
    let broker = FakeBroker::new();
    let datasource = datasource(&broker);
    let path = "topic=a.useInterval=false.includeSchema=false.interval=0s";

    assert_eq!(datasource.subscribe_stream(path), SubscribeStreamStatus::Ok);
    assert!(datasource.publish_stream(path).is_err());
}
