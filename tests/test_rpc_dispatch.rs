//! Server-side RPC through a running client


use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tb_device_client::storage::{DEVICE_TOKEN_KEY, IS_CLAIMED_KEY};
use tb_device_client::testing::MockTransport;
use tb_device_client::transport::{QoS, TransportEvent};
use tb_device_client::DeviceClient;
use test_helpers::{settle, started_client, test_config, wait_connected, wait_until};

async fn connected_claimed_client() -> (DeviceClient<MockTransport>, MockTransport) {
    let (client, transport, _store) = started_client(
        test_config(),
        &[(DEVICE_TOKEN_KEY, "tok"), (IS_CLAIMED_KEY, "1")],
    )
    .await;
    transport.inject(TransportEvent::Connected).await;
    wait_connected(&client, true).await;
    (client, transport)
}

#[tokio::test]
async fn test_registered_method_gets_correlated_response() {
    let (client, transport) = connected_claimed_client().await;
    client
        .register_rpc("getCurrentTime", |_params: Value| {
            Some(json!({"time": 1700000000}))
        })
        .await;

    transport
        .inject_message(
            "v1/devices/me/rpc/request/17",
            br#"{"method":"getCurrentTime","params":{}}"#,
        )
        .await;

    wait_until("RPC response", || {
        !transport
            .published_to("v1/devices/me/rpc/response/17")
            .is_empty()
    })
    .await;

    let published = transport.published();
    let response = published
        .iter()
        .find(|m| m.topic == "v1/devices/me/rpc/response/17")
        .unwrap();
    assert_eq!(response.qos, QoS::AtLeastOnce);
    let body: Value = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(body, json!({"time": 1700000000}));
}

#[tokio::test]
async fn test_unknown_method_gets_no_response() {
    let (_client, transport) = connected_claimed_client().await;

    transport
        .inject_message(
            "v1/devices/me/rpc/request/42",
            br#"{"method":"unknownMethod"}"#,
        )
        .await;
    settle().await;

    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn test_handler_receives_params_and_may_stay_silent() {
    let (client, transport) = connected_claimed_client().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    client
        .register_rpc("setLightState", move |params: Value| -> Option<Value> {
            if params == json!({"on": true}) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            None
        })
        .await;

    transport
        .inject_message(
            "v1/devices/me/rpc/request/3",
            br#"{"method":"setLightState","params":{"on":true}}"#,
        )
        .await;

    wait_until("handler call", || calls.load(Ordering::SeqCst) == 1).await;
    settle().await;
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn test_malformed_requests_are_dropped() {
    let (client, transport) = connected_claimed_client().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    client
        .register_rpc("ping", move |_params: Value| {
            seen.fetch_add(1, Ordering::SeqCst);
            Some(json!("pong"))
        })
        .await;

    let malformed: [(&str, &[u8]); 6] = [
        ("v1/devices/me/rpc/request/", br#"{"method":"ping"}"#),
        ("v1/devices/me/rpc/request/1234567890123456", br#"{"method":"ping"}"#),
        ("v1/devices/me/rpc/request/5", b"not json"),
        ("v1/devices/me/rpc/request/5", b"[1,2,3]"),
        ("v1/devices/me/rpc/request/5", br#"{"params":{}}"#),
        ("v1/devices/me/rpc/request/5", br#"{"method":42}"#),
    ];
    for (topic, payload) in malformed {
        transport.inject_message(topic, payload).await;
    }
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(transport.published().is_empty());

    // A well-formed request still works afterwards
    transport
        .inject_message("v1/devices/me/rpc/request/6", br#"{"method":"ping"}"#)
        .await;
    wait_until("ping response", || {
        transport.published_to("v1/devices/me/rpc/response/6") == vec![b"\"pong\"".to_vec()]
    })
    .await;
}
