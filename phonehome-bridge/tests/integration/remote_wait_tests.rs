use std::time::{Duration, Instant};

use serde_json::Value;

use phonehome_common::{BridgeConfig, CallbackKind, CorrelationToken, ServeMode};

use crate::common::{init_test_logging, local_config, start_bridge, url, wait_for_pending};

#[tokio::test]
async fn test_remote_wait_receives_callback() {
    init_test_logging();
    crate::test_log!("TEST START: test_remote_wait_receives_callback");

    let (mut bridge, addr) = start_bridge(local_config(ServeMode::Forever)).await;
    let client = reqwest::Client::new();

    let wait = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .get(url(addr, "/wait/connectivity/vm-remote?timeout_secs=10"))
                .send()
                .await
                .unwrap()
        })
    };
    wait_for_pending(bridge.bus(), CallbackKind::Connectivity, 1).await;

    let posted = client
        .post(url(addr, "/phonehome"))
        .header("TransactionId", "tx-remote")
        .body("hostname=vm-remote")
        .send()
        .await
        .unwrap();
    assert_eq!(posted.status(), 200);

    let response = wait.await.unwrap();
    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["delivered"], true);
    assert_eq!(json["kind"], "connectivity");
    assert_eq!(json["token"], "vm-remote");
    assert_eq!(json["transaction_id"], "tx-remote");
    assert_eq!(json["payload"], "hostname=vm-remote");
    assert!(json["received_at"].is_string());

    bridge.stop().await.unwrap();
    crate::test_log!("TEST PASS: test_remote_wait_receives_callback");
}

#[tokio::test]
async fn test_remote_wait_timeout_is_clamped() {
    init_test_logging();
    let config = BridgeConfig {
        wait_timeout: Duration::from_millis(300),
        ..local_config(ServeMode::Forever)
    };
    let (mut bridge, addr) = start_bridge(config).await;

    let started = Instant::now();
    let response = reqwest::Client::new()
        .get(url(addr, "/wait/metadata/vm-never?timeout_secs=600"))
        .send()
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["delivered"], false);
    assert_eq!(json["kind"], "metadata");
    assert_eq!(json["token"], "vm-never");

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_remote_wait_conflicts_with_local_wait() {
    init_test_logging();
    let (mut bridge, addr) = start_bridge(local_config(ServeMode::Forever)).await;
    let waiter = bridge.waiter(CallbackKind::Connectivity);
    let local = tokio::spawn(async move {
        waiter
            .wait(CorrelationToken::new("vm-dup").unwrap(), Duration::from_millis(500))
            .await
    });
    wait_for_pending(bridge.bus(), CallbackKind::Connectivity, 1).await;

    let response = reqwest::Client::new()
        .get(url(addr, "/wait/connectivity/vm-dup?timeout_secs=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    assert!(local.await.unwrap().is_ok());
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_disconnected_remote_waiter_is_unregistered() {
    init_test_logging();
    let (mut bridge, addr) = start_bridge(local_config(ServeMode::Forever)).await;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let result = client
        .get(url(addr, "/wait/connectivity/vm-gone?timeout_secs=60"))
        .send()
        .await;
    assert!(result.is_err(), "client should give up first");
    drop(client);

    let mut cleared = false;
    for _ in 0..400 {
        if bridge.bus().pending(CallbackKind::Connectivity) == 0 {
            cleared = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(cleared, "registration should be removed after disconnect");

    bridge.stop().await.unwrap();
}
