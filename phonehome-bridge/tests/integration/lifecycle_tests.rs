use std::time::Duration;

use phonehome_bridge::{BridgeError, BridgeState, PhoneHomeBridge, WaitOutcome};
use phonehome_common::{BridgeConfig, CallbackKind, CorrelationToken, ServeMode};

use crate::common::{init_test_logging, local_config, start_bridge, url, wait_for_pending};

#[tokio::test]
async fn test_single_shot_stops_after_first_request() {
    init_test_logging();
    crate::test_log!("TEST START: test_single_shot_stops_after_first_request");

    let (mut bridge, addr) = start_bridge(local_config(ServeMode::SingleShot)).await;
    let response = reqwest::Client::new()
        .post(url(addr, "/phonehome"))
        .body("hostname=vm-once")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    tokio::time::timeout(Duration::from_secs(5), bridge.join())
        .await
        .expect("single-shot bridge should stop after one request")
        .unwrap();
    assert_eq!(bridge.state(), BridgeState::Stopped);

    let second = reqwest::Client::new()
        .post(url(addr, "/phonehome"))
        .body("hostname=vm-twice")
        .send()
        .await;
    assert!(second.is_err(), "listener should be closed");

    crate::test_log!("TEST PASS: test_single_shot_stops_after_first_request");
}

#[tokio::test]
async fn test_second_bridge_on_same_port_fails_to_bind() {
    init_test_logging();
    let (mut first, addr) = start_bridge(local_config(ServeMode::Forever)).await;

    let config = BridgeConfig {
        port: addr.port(),
        ..local_config(ServeMode::Forever)
    };
    let mut second = PhoneHomeBridge::new(config).unwrap();
    let err = second.start().await.unwrap_err();
    match err {
        BridgeError::Bind { addr: failed, .. } => assert_eq!(failed.port(), addr.port()),
        other => panic!("expected bind error, got {other:?}"),
    }

    first.stop().await.unwrap();
}

#[tokio::test]
async fn test_endpoint_url_selects_listen_port() {
    init_test_logging();
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let config = BridgeConfig {
        callback_endpoint: Some(format!("http://127.0.0.1:{port}/phonehome")),
        ..local_config(ServeMode::Forever)
    };
    let (mut bridge, addr) = start_bridge(config).await;
    assert_eq!(addr.port(), port);
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_leaves_pending_waiters_to_time_out() {
    init_test_logging();
    let (mut bridge, _addr) = start_bridge(local_config(ServeMode::Forever)).await;
    let waiter = bridge.waiter(CallbackKind::Metadata);
    let wait = tokio::spawn(async move {
        waiter
            .wait(CorrelationToken::new("vm-late").unwrap(), Duration::from_millis(300))
            .await
    });
    wait_for_pending(bridge.bus(), CallbackKind::Metadata, 1).await;

    bridge.stop().await.unwrap();
    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert_eq!(wait.await.unwrap().unwrap(), WaitOutcome::TimedOut);
    assert_eq!(bridge.bus().pending(CallbackKind::Metadata), 0);
}

#[tokio::test]
async fn test_bridge_cannot_restart() {
    init_test_logging();
    let (mut bridge, _addr) = start_bridge(local_config(ServeMode::Forever)).await;
    bridge.stop().await.unwrap();
    assert!(matches!(
        bridge.start().await,
        Err(BridgeError::InvalidState { .. })
    ));
}
