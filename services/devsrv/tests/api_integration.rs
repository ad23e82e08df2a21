//! HTTP surface contract tests via tower's oneshot

mod support;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use devsrv::api::{router, AppState};
use support::*;

fn app(registry: std::sync::Arc<devsrv::core::PollingRegistry>) -> Router {
    router(AppState::new(registry))
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    decompose(response).await
}

async fn post(app: Router, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(json) => Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    decompose(app.oneshot(request).await.unwrap()).await
}

async fn decompose(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn health_and_status_routes() {
    let simulator = ModbusTcpSimulator::start().await;
    let registry = build_registry(vec![device_from_json(tcp_device_json(
        DEVICE_A,
        simulator.addr,
    ))]);
    let app = app(registry);

    let (status, body) = get(app.clone(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = get(app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["activePollers"], 0);
}

#[tokio::test]
async fn malformed_device_id_is_rejected() {
    let simulator = ModbusTcpSimulator::start().await;
    let registry = build_registry(vec![device_from_json(tcp_device_json(
        DEVICE_A,
        simulator.addr,
    ))]);
    let app = app(registry);

    let (status, body) = post(app.clone(), "/devices/not-hex/test", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["status"], "ERROR");

    let (status, _) = get(app, "/devices/1234/read").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_device_is_404() {
    let simulator = ModbusTcpSimulator::start().await;
    let registry = build_registry(vec![device_from_json(tcp_device_json(
        DEVICE_A,
        simulator.addr,
    ))]);
    let app = app(registry);

    let (status, body) = get(app, &format!("/devices/{UNKNOWN_DEVICE}/read")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["deviceInfo"]["id"], UNKNOWN_DEVICE);
}

#[tokio::test]
async fn test_endpoint_reports_connected() {
    let simulator = ModbusTcpSimulator::start().await;
    simulator.set_register(0, 1);
    let registry = build_registry(vec![device_from_json(tcp_device_json(
        DEVICE_A,
        simulator.addr,
    ))]);
    let app = app(registry);

    let (status, body) = post(app, &format!("/devices/{DEVICE_A}/test"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "CONNECTED");
    assert_eq!(body["deviceInfo"]["connectionType"], "TCP");
}

#[tokio::test]
async fn test_endpoint_classifies_timeout() {
    let simulator = ModbusTcpSimulator::start().await;
    simulator.set_silent(true);

    let mut device = tcp_device_json(DEVICE_A, simulator.addr);
    device["advanced"] = serde_json::json!({
        "connectionOptions": { "timeout": 150, "retries": 0, "retryInterval": 0 }
    });
    let registry = build_registry(vec![device_from_json(device)]);
    let app = app(registry);

    let (status, body) = post(app, &format!("/devices/{DEVICE_A}/test"), None).await;
    // Connection failures keep HTTP 200 so the UI receives the body
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["status"], "ERROR");
    assert_eq!(body["errorType"], "CONNECTION_TIMEOUT");
}

#[tokio::test]
async fn disabled_device_read_is_400() {
    let simulator = ModbusTcpSimulator::start().await;
    let mut device = tcp_device_json(DEVICE_A, simulator.addr);
    device["enabled"] = serde_json::json!(false);
    let registry = build_registry(vec![device_from_json(device)]);
    let app = app(registry);

    let (status, body) = get(app, &format!("/devices/{DEVICE_A}/read")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn polling_start_data_stop_flow() {
    let simulator = ModbusTcpSimulator::start().await;
    simulator.set_register(0, 42);
    let registry = build_registry(vec![device_from_json(tcp_device_json(
        DEVICE_A,
        simulator.addr,
    ))]);
    let app = app(registry);

    let (status, body) = post(
        app.clone(),
        &format!("/devices/{DEVICE_A}/polling/start"),
        Some(serde_json::json!({ "intervalMs": 2000 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["deviceId"], DEVICE_A);
    assert_eq!(body["intervalMs"], 2000);

    let (status, body) = get(app.clone(), &format!("/devices/{DEVICE_A}/data")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["hasData"], true);
    assert_eq!(body["stale"], false);
    assert_eq!(body["readings"][0]["value"], 42.0);

    let (status, body) = post(app.clone(), &format!("/devices/{DEVICE_A}/polling/stop"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    // forceRefresh triggers a fresh one-shot read on the stopped poller
    simulator.set_register(0, 43);
    let (status, body) = get(
        app,
        &format!("/devices/{DEVICE_A}/data?forceRefresh=true"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["readings"][0]["value"], 43.0);
    assert_eq!(body["stale"], true);
}

#[tokio::test]
async fn read_endpoint_returns_fresh_snapshot_body() {
    let simulator = ModbusTcpSimulator::start().await;
    simulator.set_register(0, 7);
    let registry = build_registry(vec![device_from_json(tcp_device_json(
        DEVICE_A,
        simulator.addr,
    ))]);
    let app = app(registry);

    let (status, body) = get(app, &format!("/devices/{DEVICE_A}/read")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deviceId"], DEVICE_A);
    assert_eq!(body["deviceName"], "Test Meter");
    assert_eq!(body["readings"][0]["name"], "word0");
    assert_eq!(body["readings"][0]["value"], 7.0);
}

#[tokio::test]
async fn control_groups_contiguous_registers_into_one_write() {
    let simulator = ModbusTcpSimulator::start().await;
    let registry = build_registry(vec![device_from_json(tcp_device_json(
        DEVICE_A,
        simulator.addr,
    ))]);
    let app = app(registry);

    let (status, body) = post(
        app,
        &format!("/devices/{DEVICE_A}/control"),
        Some(serde_json::json!({
            "parameters": [
                { "name": "a", "registerIndex": 10, "value": 1, "dataType": "UINT16" },
                { "name": "b", "registerIndex": 11, "value": 2, "dataType": "UINT16" },
                { "name": "c", "registerIndex": 30, "value": 3, "dataType": "UINT16" }
            ]
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["summary"], "3/3 parameters written");
    assert_eq!(body["results"].as_array().unwrap().len(), 3);

    let writes = simulator.state.writes.read().clone();
    assert_eq!(writes.len(), 2, "contiguous registers must share one FC16");
    // First write: FC16 at address 10, two registers
    assert_eq!(writes[0][0], 0x10);
    assert_eq!(u16::from_be_bytes([writes[0][1], writes[0][2]]), 10);
    assert_eq!(u16::from_be_bytes([writes[0][3], writes[0][4]]), 2);
    // Second write: isolated register goes out as FC6
    assert_eq!(writes[1][0], 0x06);
    assert_eq!(u16::from_be_bytes([writes[1][1], writes[1][2]]), 30);
}

#[tokio::test]
async fn control_without_body_is_400() {
    let simulator = ModbusTcpSimulator::start().await;
    let registry = build_registry(vec![device_from_json(tcp_device_json(
        DEVICE_A,
        simulator.addr,
    ))]);
    let app = app(registry);

    let (status, body) = post(app, &format!("/devices/{DEVICE_A}/control"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}
