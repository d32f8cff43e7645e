use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use phonehome_bridge::WaitOutcome;
use phonehome_common::{BridgeConfig, CallbackKind, CorrelationToken, ServeMode};

use crate::common::{init_test_logging, local_config, start_bridge, url, wait_for_pending};

fn token(s: &str) -> CorrelationToken {
    CorrelationToken::new(s).unwrap()
}

/// Send raw bytes and collect whatever the server answers within a few seconds.
async fn raw_exchange(addr: std::net::SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
        }
        if String::from_utf8_lossy(&buf).contains("\r\n\r\n") && buf.ends_with(b"received") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn test_connectivity_callback_over_http() {
    init_test_logging();
    crate::test_log!("TEST START: test_connectivity_callback_over_http");

    let (mut bridge, addr) = start_bridge(local_config(ServeMode::Forever)).await;
    let waiter = bridge.waiter(CallbackKind::Connectivity);
    let wait = tokio::spawn(async move { waiter.wait(token("vm-42"), Duration::from_secs(10)).await });
    wait_for_pending(bridge.bus(), CallbackKind::Connectivity, 1).await;

    let response = reqwest::Client::new()
        .post(url(addr, "/phonehome"))
        .body("instance_id=i-1&hostname=vm-42&fqdn=vm-42.local")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("transactionid"));

    let outcome = wait.await.unwrap().unwrap();
    assert_eq!(
        outcome.into_payload().as_deref(),
        Some("instance_id=i-1&hostname=vm-42&fqdn=vm-42.local")
    );

    bridge.stop().await.unwrap();
    crate::test_log!("TEST PASS: test_connectivity_callback_over_http");
}

#[tokio::test]
async fn test_concurrent_vms_only_matching_waiter_wakes() {
    init_test_logging();
    crate::test_log!("TEST START: test_concurrent_vms_only_matching_waiter_wakes");

    let (mut bridge, addr) = start_bridge(local_config(ServeMode::Forever)).await;
    let vm1 = {
        let waiter = bridge.waiter(CallbackKind::Connectivity);
        tokio::spawn(async move { waiter.wait(token("vm-1"), Duration::from_millis(500)).await })
    };
    let vm2 = {
        let waiter = bridge.waiter(CallbackKind::Connectivity);
        tokio::spawn(async move { waiter.wait(token("vm-2"), Duration::from_secs(10)).await })
    };
    wait_for_pending(bridge.bus(), CallbackKind::Connectivity, 2).await;

    let response = reqwest::Client::new()
        .post(url(addr, "/phonehome"))
        .body("hostname=vm-2")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    assert!(vm2.await.unwrap().unwrap().is_delivered());
    assert_eq!(vm1.await.unwrap().unwrap(), WaitOutcome::TimedOut);
    assert_eq!(bridge.bus().pending(CallbackKind::Connectivity), 0);

    bridge.stop().await.unwrap();
    crate::test_log!("TEST PASS: test_concurrent_vms_only_matching_waiter_wakes");
}

#[tokio::test]
async fn test_metadata_callback_echoes_transaction_id() {
    init_test_logging();
    let (mut bridge, addr) = start_bridge(local_config(ServeMode::Forever)).await;
    let waiter = bridge.waiter(CallbackKind::Metadata);
    let wait = tokio::spawn(async move { waiter.wait(token("vm-m"), Duration::from_secs(10)).await });
    wait_for_pending(bridge.bus(), CallbackKind::Metadata, 1).await;

    let response = reqwest::Client::new()
        .post(url(addr, "/metadata"))
        .header("Hostname", "vm-m")
        .header("TransactionId", "tx-abc")
        .body("{\"ok\": true}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["transactionid"], "tx-abc");

    let outcome = wait.await.unwrap().unwrap();
    let callback = outcome.callback().unwrap();
    assert_eq!(callback.kind, CallbackKind::Metadata);
    assert_eq!(callback.transaction_id.as_str(), "tx-abc");
    assert_eq!(callback.payload, "{\"ok\": true}");

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_unawaited_callback_is_acknowledged() {
    init_test_logging();
    let (mut bridge, addr) = start_bridge(local_config(ServeMode::Forever)).await;

    let response = reqwest::Client::new()
        .post(url(addr, "/phonehome"))
        .body("hostname=belongs-to-another-run")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_content_length_over_raw_socket() {
    init_test_logging();
    let (mut bridge, addr) = start_bridge(local_config(ServeMode::Forever)).await;

    let response = raw_exchange(
        addr,
        b"POST /phonehome HTTP/1.1\r\nHost: bridge\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(
        response.starts_with("HTTP/1.1 411"),
        "unexpected response: {response}"
    );
    assert!(response.to_ascii_lowercase().contains("transactionid:"));

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_truncated_body_times_out_as_invalid_data() {
    init_test_logging();
    let config = BridgeConfig {
        read_timeout: Duration::from_millis(200),
        ..local_config(ServeMode::Forever)
    };
    let (mut bridge, addr) = start_bridge(config).await;

    let response = raw_exchange(
        addr,
        b"POST /phonehome HTTP/1.1\r\nHost: bridge\r\nContent-Length: 100\r\n\r\nhostname=vm",
    )
    .await;
    assert!(
        response.starts_with("HTTP/1.1 400"),
        "unexpected response: {response}"
    );
    assert!(response.ends_with("invalid data received"));

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    init_test_logging();
    let (mut bridge, addr) = start_bridge(local_config(ServeMode::Forever)).await;

    let response = reqwest::Client::new()
        .post(url(addr, "/not-a-callback"))
        .body("hostname=vm-1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_custom_paths_are_served() {
    init_test_logging();
    let config = BridgeConfig {
        connectivity_path: "/boot/done".to_string(),
        metadata_path: "/boot/metadata".to_string(),
        ..local_config(ServeMode::Forever)
    };
    let (mut bridge, addr) = start_bridge(config).await;
    let client = reqwest::Client::new();

    let custom = client
        .post(url(addr, "/boot/done"))
        .body("hostname=vm-1")
        .send()
        .await
        .unwrap();
    assert_eq!(custom.status(), 200);

    let default = client
        .post(url(addr, "/phonehome"))
        .body("hostname=vm-1")
        .send()
        .await
        .unwrap();
    assert_eq!(default.status(), 404);

    bridge.stop().await.unwrap();
}
