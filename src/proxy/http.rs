//! Plain-HTTP proxy request handler: a non-`CONNECT` request
//! whose target URL is absolute, relayed to the upstream origin verbatim
//! apart from hop-by-hop stripping and the audit header.

use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::logger;
use crate::proxy::wire::{
    self, dial_upstream, forward_chunked_request_body, forward_fixed_length_body,
    read_response_head, respond_with_status, stream_response_body, write_request_head,
    ParsedRequest, RequestBodyKind, RequestBodyTooLarge, UpstreamStream, PROXY_NAME,
};

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handles one already-parsed plain-HTTP request on `client`, relaying it
/// to its upstream origin and writing the response back. Returns once the
/// response has been fully written; the caller decides whether to loop for
/// keep-alive.
pub async fn handle<S>(
    client: &mut S,
    mut parsed: ParsedRequest,
    tls_client_config: Arc<ClientConfig>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let host = parsed.host.clone();

    parsed.strip_hop_by_hop();
    parsed.set_header("X-Proxied-By", PROXY_NAME);

    let tls = if parsed.scheme == "https" {
        Some(tls_client_config)
    } else {
        None
    };

    let mut upstream = match dial_upstream(
        &parsed.host,
        parsed.port,
        tls,
        UPSTREAM_CONNECT_TIMEOUT,
        UPSTREAM_HANDSHAKE_TIMEOUT,
    )
    .await
    {
        Ok(stream) => stream,
        Err(err) => {
            logger::error(&format!("connecting to upstream {host}"), &err);
            let (code, label) = if err.to_string().contains("timed out") {
                (504, "Gateway Timeout")
            } else {
                (502, "Bad Gateway")
            };
            respond_with_status(client, code, label, "Unable to reach upstream server").await?;
            return Ok(());
        }
    };

    if let Err(err) = forward_request(client, &mut upstream, &mut parsed).await {
        let is_too_large = err.downcast_ref::<RequestBodyTooLarge>().is_some();
        let (code, label, body) = if is_too_large {
            (413, "Payload Too Large", "Request body exceeds allowed size")
        } else {
            (500, "Internal Server Error", "Failed to forward request")
        };
        logger::error(&format!("forwarding request to {host}"), &err);
        respond_with_status(client, code, label, body).await?;
        return Ok(());
    }
    let _ = upstream.flush().await;

    match read_response_head(&mut upstream).await {
        Ok(mut response_head) => {
            client.write_all(&response_head.raw_head).await?;

            let is_chunked = wire::header_value(&response_head.headers, "transfer-encoding")
                .map(|v| v.to_ascii_lowercase().contains("chunked"))
                .unwrap_or(false);
            let content_length = wire::header_value(&response_head.headers, "content-length")
                .and_then(|v| v.parse::<usize>().ok());

            if is_chunked {
                forward_chunked_body(
                    std::mem::take(&mut response_head.body_prefix),
                    &mut upstream,
                    client,
                )
                .await?;
            } else if let Some(len) = content_length {
                let already = response_head.body_prefix.len();
                if !response_head.body_prefix.is_empty() {
                    client.write_all(&response_head.body_prefix).await?;
                }
                if already < len {
                    let rest = wire::read_exact_body(&mut upstream, len - already).await?;
                    client.write_all(&rest).await?;
                }
            } else {
                if !response_head.body_prefix.is_empty() {
                    client.write_all(&response_head.body_prefix).await?;
                }
                stream_response_body(&mut upstream, client).await?;
            }

            client.flush().await?;
            logger::request(&host, response_head.status_code);
            Ok(())
        }
        Err(err) => {
            logger::error(&format!("reading response from {host}"), &err);
            respond_with_status(client, 502, "Bad Gateway", "Failed to read response").await?;
            Ok(())
        }
    }
}

async fn forward_request<C, U>(
    client: &mut C,
    upstream: &mut U,
    parsed: &mut ParsedRequest,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    write_request_head(
        upstream,
        &parsed.method.to_string(),
        &parsed.path,
        &parsed.version,
        &parsed.headers,
    )
    .await?;

    match &parsed.body_kind {
        RequestBodyKind::None => {}
        RequestBodyKind::ContentLength(length) => {
            let length = *length;
            if length > wire::MAX_REQUEST_BODY_BYTES {
                return Err(RequestBodyTooLarge {
                    limit: wire::MAX_REQUEST_BODY_BYTES,
                }
                .into());
            }
            forward_fixed_length_body(client, upstream, &mut parsed.buffered_body, length).await?;
        }
        RequestBodyKind::Chunked => {
            forward_chunked_request_body(client, upstream, &mut parsed.buffered_body).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::wire::{read_http_request, RequestScheme};
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn injects_audit_header_and_relays_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let upstream_task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK")
                .await
                .unwrap();
            request
        });

        let (mut test_client, mut server_side) = duplex(8192);
        test_client
            .write_all(
                format!(
                    "GET http://127.0.0.1:{}/headers HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 0\r\n\r\n",
                    addr.port()
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let parsed = read_http_request(&mut server_side, RequestScheme::Http)
            .await
            .unwrap();
        let config = Arc::new(wire::build_tls_client_config().unwrap());
        handle(&mut server_side, parsed, config).await.unwrap();

        let mut resp = vec![0u8; 512];
        let n = test_client.read(&mut resp).await.unwrap();
        let response = String::from_utf8_lossy(&resp[..n]);
        assert!(response.contains("200 OK"));
        assert!(response.contains("OK"));

        let observed_request = upstream_task.await.unwrap();
        assert!(observed_request.contains("X-Proxied-By: GoSniffer"));
    }
}
