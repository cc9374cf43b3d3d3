//! WebSocket upgrade detection and opaque bidirectional tunneling.
//!
//! No RFC6455 frame parsing: once the upgrade handshake completes, bytes
//! are copied verbatim in both directions. There's nowhere to persist a
//! decoded message to, so there's nothing to gain from parsing frames.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::proxy::wire::header_value;

/// True if the request headers describe a WebSocket upgrade handshake:
/// `Upgrade: websocket` and a `Connection` header that contains `upgrade`,
/// both case-insensitively.
pub fn is_upgrade_request(headers: &HashMap<String, String>) -> bool {
    let upgrades = header_value(headers, "upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_upgrades = header_value(headers, "connection")
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrades && connection_upgrades
}

/// Copies bytes bidirectionally between `client` and `upstream` until
/// either side hits EOF or an error; the first side to finish wins and
/// tears down the other half too.
pub async fn tunnel<C, U>(client: &mut C, upstream: &mut U) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut upstream_reader, mut upstream_writer) = tokio::io::split(upstream);

    let client_to_upstream = tokio::io::copy(&mut client_reader, &mut upstream_writer);
    let upstream_to_client = tokio::io::copy(&mut upstream_reader, &mut client_writer);

    tokio::select! {
        result = client_to_upstream => {
            if let Err(e) = result {
                tracing::debug!("websocket: client to upstream error: {e}");
            }
        }
        result = upstream_to_client => {
            if let Err(e) = result {
                tracing::debug!("websocket: upstream to client error: {e}");
            }
        }
    }

    let _ = upstream_writer.shutdown().await;
    let _ = client_writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[test]
    fn detects_case_insensitive_upgrade_headers() {
        let mut headers = HashMap::new();
        headers.insert("Upgrade".to_string(), "WebSocket".to_string());
        headers.insert("Connection".to_string(), "Upgrade".to_string());
        assert!(is_upgrade_request(&headers));
    }

    #[test]
    fn rejects_missing_connection_header() {
        let mut headers = HashMap::new();
        headers.insert("Upgrade".to_string(), "websocket".to_string());
        assert!(!is_upgrade_request(&headers));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tunnels_bytes_in_both_directions() {
        let (mut client, mut client_peer) = duplex(1024);
        let (mut upstream, mut upstream_peer) = duplex(1024);

        let tunnel_task = tokio::spawn(async move { tunnel(&mut client, &mut upstream).await });

        client_peer.write_all(b"hello-upstream").await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = upstream_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello-upstream");

        upstream_peer.write_all(b"hello-client").await.unwrap();
        let n = client_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello-client");

        drop(client_peer);
        drop(upstream_peer);
        let _ = tunnel_task.await;
    }
}
