//! Proxy server: accept loop, per-connection task spawning, dispatch to
//! the plain-HTTP handler or the MITM engine based on method.

use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::cert::cache::CertificateCache;
use crate::cert::ca::RootCa;
use crate::config::Config;
use crate::error::is_client_disconnect;
use crate::logger;
use crate::proxy::wire::{self, read_http_request, respond_with_status, should_keep_alive, HttpMethod, RequestScheme};
use crate::proxy::{http, mitm};
use crate::shutdown::ShutdownCoordinator;

const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the accept loop until the coordinator's shutdown token fires.
/// Listener bind failures propagate to the caller; per-connection errors
/// are contained so one bad connection never stops the loop.
pub async fn run(config: Arc<Config>, coordinator: ShutdownCoordinator) -> anyhow::Result<()> {
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("proxy listening on {addr}");

    let root_ca = Arc::new(RootCa::load_or_generate(
        &config.ca_cert_path,
        &config.ca_key_path,
        config.key_algorithm,
    )?);
    let cache = CertificateCache::new();
    let tls_client_config = Arc::new(wire::build_tls_client_config()?);

    let cancel = coordinator.context();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (socket, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        logger::error("accepting connection", &err.into());
                        continue;
                    }
                };
                tracing::debug!("connection from {peer_addr}");

                let guard = coordinator.track();
                let guard_id = guard.id();
                let shutdown_token = guard.token();
                let root_ca = root_ca.clone();
                let cache = cache.clone();
                let tls_client_config = tls_client_config.clone();
                let enable_https = config.enable_https;

                // The connection was already accepted, so it always runs to
                // completion: shutdown only stops new accepts and new
                // keep-alive iterations (checked inside `handle_connection`),
                // never a handler that's already mid-request. `shutdown()`
                // force-aborts this task via the registered abort handle if
                // it's still running after the drain timeout expires.
                let join_handle = tokio::spawn(async move {
                    let _guard = guard;
                    let result =
                        handle_connection(socket, enable_https, root_ca, cache, tls_client_config, shutdown_token)
                            .await;
                    if let Err(err) = result {
                        if is_client_disconnect(&err) {
                            tracing::debug!("connection closed by client: {err}");
                        } else {
                            logger::error("handling connection", &err);
                        }
                    }
                });
                coordinator.set_abort_handle(guard_id, join_handle.abort_handle());
            }
        }
    }

    cache.stop();
    tracing::info!("proxy stopped accepting connections");
    Ok(())
}

async fn handle_connection(
    mut socket: TcpStream,
    enable_https: bool,
    root_ca: Arc<RootCa>,
    cache: Arc<CertificateCache>,
    tls_client_config: Arc<ClientConfig>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut request_number = 0u32;

    loop {
        // The first request was already in flight (or about to start) when
        // this connection was accepted, so it always completes. Only a
        // later keep-alive iteration is gated on the shutdown signal.
        if request_number > 0 && shutdown.is_cancelled() {
            return Ok(());
        }
        request_number += 1;

        let parsed = match tokio::time::timeout(
            KEEP_ALIVE_TIMEOUT,
            read_http_request(&mut socket, RequestScheme::Http),
        )
        .await
        {
            Ok(Ok(req)) => req,
            Ok(Err(err)) => {
                if request_number == 1 {
                    let _ = respond_with_status(&mut socket, 400, "Bad Request", "Unable to parse HTTP request").await;
                    return Err(err);
                }
                return Ok(());
            }
            Err(_) => return Ok(()), // keep-alive idle timeout
        };

        if parsed.method == HttpMethod::Connect {
            if enable_https {
                let host = parsed.host.clone();
                let port = parsed.port;
                return mitm::intercept(socket, host, port, root_ca, cache, tls_client_config, shutdown).await;
            }
            return handle_plain_tunnel(socket, &parsed.host, parsed.port).await;
        }

        let keep_alive = should_keep_alive(&parsed.version, &parsed.header_map());
        http::handle(&mut socket, parsed, tls_client_config.clone()).await?;

        if !keep_alive {
            return Ok(());
        }
    }
}

/// `--disable-https`: CONNECT tunnels become an opaque byte relay with no
/// interception, rather than going through the MITM engine at all.
async fn handle_plain_tunnel(mut client: TcpStream, host: &str, port: u16) -> anyhow::Result<()> {
    match TcpStream::connect((host, port)).await {
        Ok(mut upstream) => {
            client
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
            Ok(())
        }
        Err(err) => {
            let _ = client
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await;
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::ca::KeyAlgorithm;
    use std::net::TcpListener as StdTcpListener;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};

    fn available_port() -> u16 {
        StdTcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn relays_plain_http_and_injects_audit_header() {
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
        let config = Arc::new(Config {
            bind_address: "127.0.0.1".to_string(),
            port: available_port(),
            ca_cert_path: dir.path().join("ca-cert.pem"),
            ca_key_path: dir.path().join("ca-key.pem"),
            shutdown_timeout: Duration::from_secs(5),
            enable_https: true,
            key_algorithm: KeyAlgorithm::EcdsaP256,
        });
        let coordinator = ShutdownCoordinator::new();
        let proxy_addr = config.listen_addr();
        let run_config = config.clone();
        let run_coordinator = coordinator.clone();
        let server_task = tokio::spawn(async move { run(run_config, run_coordinator).await });

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

        let observed = upstream_task.await.unwrap();
        assert!(observed.contains("X-Proxied-By: GoSniffer"));

        coordinator.shutdown(Duration::from_secs(2)).await.unwrap();
        let _ = server_task.await;
    }
}
