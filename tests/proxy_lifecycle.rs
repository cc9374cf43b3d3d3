//! End-to-end proxy lifecycle scenarios (spec.md §8): a real accept loop
//! bound to a loopback port, a real upstream, and the public `Config` /
//! `ShutdownCoordinator` surface exactly as `main` wires them together.

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use gosniffer::cert::ca::KeyAlgorithm;
use gosniffer::config::Config;
use gosniffer::shutdown::ShutdownCoordinator;
use serial_test::serial;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn available_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn test_config(dir: &tempfile::TempDir) -> Arc<Config> {
    Arc::new(Config {
        bind_address: "127.0.0.1".to_string(),
        port: available_port(),
        ca_cert_path: dir.path().join("ca-cert.pem"),
        ca_key_path: dir.path().join("ca-key.pem"),
        shutdown_timeout: Duration::from_secs(5),
        enable_https: true,
        key_algorithm: KeyAlgorithm::EcdsaP256,
    })
}

/// Scenario 1: HTTP relay + header injection. The upstream observes
/// `X-Proxied-By: GoSniffer`, and the client gets the response verbatim.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn http_relay_injects_header_and_returns_body_verbatim() {
    let upstream_listener = TcpListener::bind(("127.0.0.1", available_port())).await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    let upstream_task = tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = socket.read(&mut buf).await.unwrap();
        let request = String::from_utf8_lossy(&buf[..n]).to_string();
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\ntest response")
            .await
            .unwrap();
        request
    });

    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let coordinator = ShutdownCoordinator::new();
    let proxy_addr = config.listen_addr();
    let run_config = config.clone();
    let run_coordinator = coordinator.clone();
    let server_task = tokio::spawn(async move { gosniffer::proxy::run(run_config, run_coordinator).await });

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = tokio::net::TcpStream::connect(&proxy_addr).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/headers HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut resp = vec![0u8; 512];
    let n = client.read(&mut resp).await.unwrap();
    let response = String::from_utf8_lossy(&resp[..n]);
    assert!(response.contains("200 OK"));
    assert!(response.contains("test response"));

    let observed_request = upstream_task.await.unwrap();
    assert!(observed_request.contains("X-Proxied-By: GoSniffer"));

    coordinator.shutdown(Duration::from_secs(2)).await.unwrap();
    let _ = server_task.await;
}

/// Scenario 4: graceful shutdown with an in-flight request. The request
/// completes normally, `shutdown` returns before the in-flight upstream
/// delay would be considered "stuck", and new connections are refused
/// once the accept loop has exited.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn shutdown_drains_in_flight_request_then_refuses_new_connections() {
    let upstream_listener = TcpListener::bind(("127.0.0.1", available_port())).await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    let upstream_task = tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK")
            .await
            .unwrap();
    });

    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let coordinator = ShutdownCoordinator::new();
    let proxy_addr = config.listen_addr();
    let run_config = config.clone();
    let run_coordinator = coordinator.clone();
    let server_task = tokio::spawn(async move { gosniffer::proxy::run(run_config, run_coordinator).await });

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = tokio::net::TcpStream::connect(&proxy_addr).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/slow HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let shutdown_started = std::time::Instant::now();
    let shutdown_coordinator = coordinator.clone();
    let shutdown_task =
        tokio::spawn(async move { shutdown_coordinator.shutdown(Duration::from_secs(5)).await });

    let mut resp = vec![0u8; 512];
    let n = client.read(&mut resp).await.unwrap();
    let response = String::from_utf8_lossy(&resp[..n]);
    assert!(response.contains("200 OK"), "in-flight request should complete normally");

    shutdown_task.await.unwrap().expect("shutdown should succeed once the in-flight handler drains");
    assert!(
        shutdown_started.elapsed() < Duration::from_secs(3),
        "shutdown should not wait the full timeout once the handler drains"
    );

    let refused = tokio::net::TcpStream::connect(&proxy_addr).await;
    assert!(refused.is_err(), "accept loop should have stopped taking new connections");

    upstream_task.await.unwrap();
    let _ = server_task.await;
}

/// `--disable-https`: CONNECT tunnels become an opaque byte relay instead
/// of going through the MITM engine, so no certificate is ever minted.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn disabled_https_tunnels_connect_as_opaque_bytes() {
    let upstream_listener = TcpListener::bind(("127.0.0.1", available_port())).await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    let upstream_task = tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        socket.write_all(&buf[..n]).await.unwrap(); // echo
    });

    let dir = tempdir().unwrap();
    let mut config = test_config(&dir);
    Arc::get_mut(&mut config).unwrap().enable_https = false;
    let coordinator = ShutdownCoordinator::new();
    let proxy_addr = config.listen_addr();
    let run_config = config.clone();
    let run_coordinator = coordinator.clone();
    let server_task = tokio::spawn(async move { gosniffer::proxy::run(run_config, run_coordinator).await });

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = tokio::net::TcpStream::connect(&proxy_addr).await.unwrap();
    let connect = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n", upstream_addr.port());
    client.write_all(connect.as_bytes()).await.unwrap();

    let mut established = [0u8; 64];
    let n = client.read(&mut established).await.unwrap();
    assert!(String::from_utf8_lossy(&established[..n]).starts_with("HTTP/1.1 200"));

    client.write_all(b"ping-through-tunnel").await.unwrap();
    let mut echoed = vec![0u8; 64];
    let n = client.read(&mut echoed).await.unwrap();
    assert_eq!(&echoed[..n], b"ping-through-tunnel");

    upstream_task.await.unwrap();
    coordinator.shutdown(Duration::from_secs(2)).await.unwrap();
    let _ = server_task.await;
}
