//! MITM engine: hijacks a `CONNECT` tunnel, performs dual TLS
//! handshakes (client-facing with a minted leaf, upstream-facing with full
//! verification), and relays the decrypted HTTP conversation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rustls::{ClientConfig, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsStream};
use tokio_util::sync::CancellationToken;

use crate::cert::cache::CertificateCache;
use crate::cert::leaf;
use crate::cert::ca::RootCa;
use crate::error::{is_client_disconnect, ProxyError};
use crate::logger;
use crate::proxy::websocket;
use crate::proxy::wire::{
    self, dial_upstream, forward_chunked_body, forward_chunked_request_body,
    forward_fixed_length_body, read_http_request, read_response_head, respond_with_status,
    should_keep_alive, stream_response_body, write_request_head, RequestBodyKind,
    RequestBodyTooLarge, RequestScheme, UpstreamStream, PROXY_NAME,
};

const CLIENT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const UPSTREAM_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const KEEP_ALIVE_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs the full MITM state machine for one `CONNECT` tunnel: writes the
/// `200 Connection Established` line, mints/fetches a leaf certificate,
/// performs both TLS handshakes, then relays requests until keep-alive
/// ends or an unrecoverable error occurs.
pub async fn intercept(
    mut client: TcpStream,
    host: String,
    port: u16,
    root_ca: Arc<RootCa>,
    cache: Arc<CertificateCache>,
    tls_client_config: Arc<ClientConfig>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let leaf_bundle = match cache.get(&host) {
        Some(bundle) => bundle,
        None => {
            let minted = leaf::mint(&root_ca, &host)
                .map(Arc::new)
                .map_err(|err| ProxyError::CertGeneration {
                    host: host.clone(),
                    source: err,
                })?;
            cache.put(&host, minted.clone());
            minted
        }
    };

    let server_config = build_server_config(&leaf_bundle)
        .map_err(|err| ProxyError::CertGeneration {
            host: host.clone(),
            source: err,
        })?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let tls_stream = tokio::time::timeout(CLIENT_HANDSHAKE_TIMEOUT, acceptor.accept(client))
        .await
        .map_err(|_| ProxyError::ClientTlsHandshake {
            host: host.clone(),
            source: anyhow::anyhow!("client TLS handshake timed out"),
        })?
        .map_err(|err| ProxyError::ClientTlsHandshake {
            host: host.clone(),
            source: err.into(),
        })?;
    let mut client_tls = TlsStream::from(tls_stream);

    let result = relay(&mut client_tls, &host, port, tls_client_config, shutdown).await;

    match result {
        Ok(()) => Ok(()),
        Err(err) if is_client_disconnect(&err) => {
            tracing::debug!("mitm tunnel for {host} ended: {err}");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn build_server_config(bundle: &leaf::LeafBundle) -> anyhow::Result<ServerConfig> {
    let chain = bundle.chain.clone();
    let key = bundle.key_der.clone_key();
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("building MITM server TLS config")
}

/// Dials upstream once, then loops decrypted inner requests over the same
/// connection (the state machine re-enters the relay loop directly
/// from `KeepAliveProbe` rather than re-dialing per request).
async fn relay<C>(
    client_tls: &mut C,
    host: &str,
    port: u16,
    tls_client_config: Arc<ClientConfig>,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut upstream: Option<UpstreamStream> = None;
    let mut request_count = 0u32;

    loop {
        // The first request on this tunnel was already underway (or about
        // to start) before shutdown began, so it always runs to completion.
        // Only a later keep-alive iteration is gated on the shutdown signal.
        if request_count > 0 && shutdown.is_cancelled() {
            return Ok(());
        }
        request_count += 1;

        let read_result = if request_count == 1 {
            read_http_request(client_tls, RequestScheme::Https).await
        } else {
            match tokio::time::timeout(
                KEEP_ALIVE_PROBE_TIMEOUT,
                read_http_request(client_tls, RequestScheme::Https),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => return Ok(()), // keep-alive probe timeout: close quietly
            }
        };

        let mut parsed = match read_result {
            Ok(req) => req,
            Err(err) => {
                if request_count == 1 {
                    return Err(ProxyError::InnerHttpParse {
                        host: host.to_string(),
                        source: err,
                    }
                    .into());
                }
                return Ok(()); // EOF/error on a later request is a normal close
            }
        };

        let headers = parsed.header_map();
        if websocket::is_upgrade_request(&headers) {
            let stream = ensure_upstream(&mut upstream, host, port, &tls_client_config).await?;

            write_request_head(
                stream,
                &parsed.method.to_string(),
                &parsed.path,
                &parsed.version,
                &parsed.headers,
            )
            .await?;
            if !parsed.buffered_body.is_empty() {
                stream.write_all(&parsed.buffered_body).await?;
            }
            stream.flush().await?;

            let response_head = read_response_head(stream).await.map_err(|err| {
                ProxyError::InnerHttpParse {
                    host: host.to_string(),
                    source: err,
                }
            })?;
            client_tls.write_all(&response_head.raw_head).await?;
            if !response_head.body_prefix.is_empty() {
                client_tls.write_all(&response_head.body_prefix).await?;
            }
            client_tls.flush().await?;

            logger::request(host, response_head.status_code);
            if response_head.status_code != 101 {
                return Ok(());
            }

            let stream = upstream.take().expect("upstream present after ensure_upstream");
            return tunnel_websocket(client_tls, stream).await;
        }

        parsed.strip_hop_by_hop();
        parsed.set_header("X-Proxied-By", PROXY_NAME);
        parsed.rewrite_to_absolute("https");
        let keep_alive = should_keep_alive(&parsed.version, &headers);

        let stream = ensure_upstream(&mut upstream, host, port, &tls_client_config).await?;

        if let Err(err) = forward_inner_request(client_tls, stream, &mut parsed).await {
            if is_client_disconnect(&err) {
                return Ok(());
            }
            let is_too_large = err.downcast_ref::<RequestBodyTooLarge>().is_some();
            if is_too_large {
                respond_with_status(client_tls, 413, "Payload Too Large", "Request body too large")
                    .await
                    .ok();
                return Ok(());
            }
            return Err(ProxyError::InnerHttpParse {
                host: host.to_string(),
                source: err,
            }
            .into());
        }
        let _ = stream.flush().await;

        let mut response_head = match read_response_head(stream).await {
            Ok(head) => head,
            Err(err) => {
                return Err(ProxyError::UpstreamTransport {
                    host: host.to_string(),
                    source: err,
                }
                .into());
            }
        };

        client_tls.write_all(&response_head.raw_head).await?;

        let is_chunked = wire::header_value(&response_head.headers, "transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        let content_length = wire::header_value(&response_head.headers, "content-length")
            .and_then(|v| v.parse::<usize>().ok());

        if is_chunked {
            forward_chunked_body(
                std::mem::take(&mut response_head.body_prefix),
                stream,
                client_tls,
            )
            .await?;
        } else if let Some(len) = content_length {
            let already = response_head.body_prefix.len();
            if !response_head.body_prefix.is_empty() {
                client_tls.write_all(&response_head.body_prefix).await?;
            }
            if already < len {
                let rest = wire::read_exact_body(stream, len - already).await?;
                client_tls.write_all(&rest).await?;
            }
        } else {
            if !response_head.body_prefix.is_empty() {
                client_tls.write_all(&response_head.body_prefix).await?;
            }
            stream_response_body(stream, client_tls).await?;
        }
        client_tls.flush().await?;

        logger::request(host, response_head.status_code);

        if !keep_alive {
            return Ok(());
        }
    }
}

async fn ensure_upstream<'a>(
    upstream: &'a mut Option<UpstreamStream>,
    host: &str,
    port: u16,
    tls_client_config: &Arc<ClientConfig>,
) -> anyhow::Result<&'a mut UpstreamStream> {
    if upstream.is_none() {
        let dialed = dial_upstream(
            host,
            port,
            Some(tls_client_config.clone()),
            UPSTREAM_CONNECT_TIMEOUT,
            UPSTREAM_HANDSHAKE_TIMEOUT,
        )
        .await
        .map_err(|err| ProxyError::UpstreamTlsVerify {
            host: host.to_string(),
            source: err,
        })?;
        *upstream = Some(dialed);
    }
    Ok(upstream.as_mut().unwrap())
}

async fn forward_inner_request<C, U>(
    client: &mut C,
    upstream: &mut U,
    parsed: &mut wire::ParsedRequest,
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

async fn tunnel_websocket<C>(client: &mut C, mut upstream: UpstreamStream) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    websocket::tunnel(client, &mut upstream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::ca::KeyAlgorithm;
    use tokio::io::duplex;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn builds_server_config_from_minted_bundle() {
        let ca = RootCa::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let bundle = leaf::mint(&ca, "example.com").unwrap();
        build_server_config(&bundle).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relay_returns_cleanly_on_immediate_client_close() {
        let (client, mut server) = duplex(1024);
        drop(client);
        let config = Arc::new(wire::build_tls_client_config().unwrap());
        let result = relay(&mut server, "example.com", 443, config, CancellationToken::new()).await;
        assert!(result.is_ok());
    }
}
