//! Poller and registry lifecycle scenarios against the TCP simulator

mod support;

use std::time::{Duration, Instant};
use support::*;

use devsrv::core::transport::TransportError;
use devsrv::model::PollerState;

#[tokio::test]
async fn polling_publishes_ordered_snapshots_and_stops_quickly() {
    let simulator = ModbusTcpSimulator::start().await;
    simulator.set_register(0, 1);

    let registry = build_registry(vec![device_from_json(tcp_device_json(
        DEVICE_A,
        simulator.addr,
    ))]);

    // Requested below the floor; the clamp raises it to one second
    registry
        .start(DEVICE_A, Some(Duration::from_millis(500)))
        .await
        .unwrap();
    assert_eq!(registry.status(DEVICE_A).status, PollerState::Active);
    assert_eq!(registry.status(DEVICE_A).interval_ms, 1000);

    let mut rx = registry.subscribe(DEVICE_A).await.unwrap();
    let mut snapshots = Vec::new();
    let deadline = Instant::now() + Duration::from_millis(2600);
    while Instant::now() < deadline && snapshots.len() < 4 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.changed()).await {
            Ok(Ok(())) => {
                if let Some(snapshot) = rx.borrow_and_update().clone() {
                    snapshots.push(snapshot);
                }
            },
            _ => break,
        }
    }

    assert!(
        snapshots.len() >= 2,
        "expected multiple published snapshots, got {}",
        snapshots.len()
    );
    for window in snapshots.windows(2) {
        assert!(
            window[1].timestamp > window[0].timestamp,
            "snapshot timestamps must be strictly increasing"
        );
    }
    for snapshot in &snapshots {
        assert!(!snapshot.stale);
        assert!(snapshot.has_data);
        assert_eq!(snapshot.values[0].value, Some(1.0));
    }

    let stop_started = Instant::now();
    registry.stop(DEVICE_A).await.unwrap();
    assert!(
        stop_started.elapsed() < Duration::from_millis(600),
        "stop must complete quickly"
    );
    assert_eq!(registry.status(DEVICE_A).status, PollerState::Stopped);
}

#[tokio::test]
async fn timeout_probe_returns_classified_error_within_budget() {
    let simulator = ModbusTcpSimulator::start().await;
    simulator.set_silent(true);

    let mut device = tcp_device_json(DEVICE_A, simulator.addr);
    device["advanced"] = serde_json::json!({
        "connectionOptions": { "timeout": 200, "retries": 2, "retryInterval": 0 }
    });

    let registry = build_registry(vec![device_from_json(device)]);

    let started = Instant::now();
    let outcome = registry.test_connection(DEVICE_A).await.unwrap();
    let elapsed = started.elapsed();

    assert!(!outcome.success);
    assert!(matches!(outcome.error, Some(TransportError::Timeout(_))));
    // Three attempts at 200ms each, plus connect and scheduling slack
    assert!(elapsed >= Duration::from_millis(600), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn partial_range_failure_keeps_poller_active() {
    let simulator = ModbusTcpSimulator::start().await;
    simulator.set_registers(0, &[11, 22]);
    // Second range always answers with IllegalDataAddress
    simulator.set_exception(100, 0x02);

    let mut device = tcp_device_json(DEVICE_A, simulator.addr);
    device["dataPoints"] = serde_json::json!([
        {
            "range": { "startAddress": 0, "count": 2, "fc": 3 },
            "parser": { "parameters": [
                { "name": "a", "dataType": "UINT16", "registerIndex": 0 },
                { "name": "b", "dataType": "UINT16", "registerIndex": 1 }
            ]}
        },
        {
            "range": { "startAddress": 100, "count": 2, "fc": 3 },
            "parser": { "parameters": [
                { "name": "c", "dataType": "UINT16", "registerIndex": 100 },
                { "name": "d", "dataType": "UINT16", "registerIndex": 101 }
            ]}
        }
    ]);

    let registry = build_registry(vec![device_from_json(device)]);
    registry.start(DEVICE_A, None).await.unwrap();

    assert_eq!(registry.status(DEVICE_A).status, PollerState::Active);

    let snapshot = registry.snapshot(DEVICE_A, false).await.unwrap();
    assert_eq!(snapshot.values.len(), 4);

    assert_eq!(snapshot.values[0].value, Some(11.0));
    assert_eq!(snapshot.values[1].value, Some(22.0));

    for failed in &snapshot.values[2..] {
        assert!(failed.value.is_none());
        let error = failed.error.as_deref().unwrap();
        assert!(
            error.contains("ILLEGAL_ADDRESS"),
            "error should name the exception, got: {error}"
        );
    }

    registry.stop(DEVICE_A).await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent_and_isolated() {
    let simulator = ModbusTcpSimulator::start().await;
    simulator.set_register(0, 5);

    let registry = build_registry(vec![
        device_from_json(tcp_device_json(DEVICE_A, simulator.addr)),
        device_from_json(tcp_device_json(DEVICE_B, simulator.addr)),
    ]);

    registry.start(DEVICE_A, None).await.unwrap();
    registry.start(DEVICE_B, None).await.unwrap();

    // Stopping A twice leaves it stopped without errors
    registry.stop(DEVICE_A).await.unwrap();
    registry.stop(DEVICE_A).await.unwrap();
    assert_eq!(registry.status(DEVICE_A).status, PollerState::Stopped);

    // B is untouched by A's lifecycle
    assert_eq!(registry.status(DEVICE_B).status, PollerState::Active);

    registry.stop(DEVICE_B).await.unwrap();
    assert_eq!(registry.status(DEVICE_B).status, PollerState::Stopped);
}

#[tokio::test]
async fn repeated_start_is_debounced_and_updates_interval() {
    let simulator = ModbusTcpSimulator::start().await;
    simulator.set_register(0, 5);

    let registry = build_registry(vec![device_from_json(tcp_device_json(
        DEVICE_A,
        simulator.addr,
    ))]);

    registry
        .start(DEVICE_A, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    let first_requests = simulator.request_count();

    // Immediate second start: accepted, interval updated, poller untouched
    registry
        .start(DEVICE_A, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let status = registry.status(DEVICE_A);
    assert_eq!(status.status, PollerState::Active);
    assert_eq!(status.interval_ms, 5000);
    // The debounced start must not have issued another synchronous tick
    assert_eq!(simulator.request_count(), first_requests);

    registry.stop(DEVICE_A).await.unwrap();
}

#[tokio::test]
async fn disabled_device_cannot_start() {
    let simulator = ModbusTcpSimulator::start().await;
    let mut device = tcp_device_json(DEVICE_A, simulator.addr);
    device["enabled"] = serde_json::json!(false);

    let registry = build_registry(vec![device_from_json(device)]);
    let error = registry.start(DEVICE_A, None).await.unwrap_err();
    assert!(matches!(error, devsrv::DevSrvError::DeviceDisabled(_)));
    assert_eq!(registry.status(DEVICE_A).status, PollerState::Stopped);
}

#[tokio::test]
async fn snapshot_cold_read_is_stale_and_cached() {
    let simulator = ModbusTcpSimulator::start().await;
    simulator.set_register(0, 9);

    let registry = build_registry(vec![device_from_json(tcp_device_json(
        DEVICE_A,
        simulator.addr,
    ))]);

    // No poller running: the snapshot comes from a one-shot read, stale
    let cold = registry.snapshot(DEVICE_A, false).await.unwrap();
    assert!(cold.stale);
    assert_eq!(cold.values[0].value, Some(9.0));
    let requests_after_cold = simulator.request_count();

    // Cached now: no new wire traffic without forceRefresh
    let cached = registry.snapshot(DEVICE_A, false).await.unwrap();
    assert_eq!(cached.timestamp, cold.timestamp);
    assert_eq!(simulator.request_count(), requests_after_cold);

    // forceRefresh reads again
    simulator.set_register(0, 10);
    let fresh = registry.snapshot(DEVICE_A, true).await.unwrap();
    assert_eq!(fresh.values[0].value, Some(10.0));
    assert!(fresh.timestamp >= cold.timestamp);
}

#[tokio::test]
async fn slow_device_ticks_coalesce_instead_of_piling_up() {
    let simulator = ModbusTcpSimulator::start().await;
    simulator.set_register(0, 1);
    // Each tick takes longer than the polling interval
    simulator.set_response_delay(Duration::from_millis(1300));

    let mut device = tcp_device_json(DEVICE_A, simulator.addr);
    device["advanced"] = serde_json::json!({
        "connectionOptions": { "timeout": 3000, "retries": 0, "retryInterval": 0 }
    });

    let registry = build_registry(vec![device_from_json(device)]);
    registry
        .start(DEVICE_A, Some(Duration::from_secs(1)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    registry.stop(DEVICE_A).await.unwrap();

    // Missed tick instants are dropped, so the request rate is bounded by
    // the tick duration, never by an accumulated backlog
    let requests = simulator.request_count();
    assert!(requests >= 2, "expected continued polling, got {requests}");
    assert!(
        requests <= 6,
        "ticks must coalesce on a slow device, got {requests}"
    );
}

#[tokio::test]
async fn shutdown_stops_everything_and_closes_sessions() {
    let simulator = ModbusTcpSimulator::start().await;
    simulator.set_register(0, 1);

    let registry = build_registry(vec![
        device_from_json(tcp_device_json(DEVICE_A, simulator.addr)),
        device_from_json(tcp_device_json(DEVICE_B, simulator.addr)),
    ]);
    registry.start(DEVICE_A, None).await.unwrap();
    registry.start(DEVICE_B, None).await.unwrap();

    let failed = registry.shutdown(Duration::from_secs(5)).await;
    assert!(failed.is_empty(), "stragglers: {failed:?}");

    assert_eq!(registry.status(DEVICE_A).status, PollerState::Stopped);
    assert_eq!(registry.status(DEVICE_B).status, PollerState::Stopped);
    assert!(registry.registry_status().sessions.is_empty());
}
