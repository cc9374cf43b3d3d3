//! Shared HTTP/1.1 wire parsing and forwarding helpers used by both the
//! plain-HTTP handler and the MITM engine.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{anyhow, Context};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, TlsStream};
use webpki_roots::TLS_SERVER_ROOTS;

pub const MAX_HEADER_BYTES: usize = 64 * 1024;
pub const MAX_HEADER_COUNT: usize = 128;
pub const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

pub const PROXY_NAME: &str = "GoSniffer";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
#[error("request body exceeds configured limit of {limit} bytes")]
pub struct RequestBodyTooLarge {
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Connect,
    Other,
}

impl FromStr for HttpMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            "HEAD" => HttpMethod::Head,
            "OPTIONS" => HttpMethod::Options,
            "PATCH" => HttpMethod::Patch,
            "TRACE" => HttpMethod::Trace,
            "CONNECT" => HttpMethod::Connect,
            _ => HttpMethod::Other,
        })
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Other => "GET",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug)]
pub enum RequestScheme {
    Http,
    Https,
}

impl RequestScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestScheme::Http => "http",
            RequestScheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            RequestScheme::Http => 80,
            RequestScheme::Https => 443,
        }
    }
}

#[derive(Debug)]
pub enum RequestBodyKind {
    None,
    ContentLength(usize),
    Chunked,
}

/// A parsed, mutable request head plus whatever body bytes were read along
/// with the header block.
pub struct ParsedRequest {
    pub method: HttpMethod,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body_kind: RequestBodyKind,
    pub buffered_body: Vec<u8>,
}

impl ParsedRequest {
    pub fn header_map(&self) -> HashMap<String, String> {
        self.headers.iter().cloned().collect()
    }

    pub fn strip_hop_by_hop(&mut self) {
        self.headers
            .retain(|(name, _)| !HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()));
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        for (key, val) in self.headers.iter_mut() {
            if key.eq_ignore_ascii_case(name) {
                *val = value.to_string();
                return;
            }
        }
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Rewrites request-line scheme/host so a downstream serializer emits
    /// an absolute-URL origin line for the tunnel's actual destination.
    pub fn rewrite_to_absolute(&mut self, scheme: &str) {
        self.scheme = scheme.to_string();
    }
}

pub struct ResponseHead {
    pub status_code: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub raw_head: Vec<u8>,
    pub body_prefix: Vec<u8>,
}

/// `Connection` header semantics: HTTP/1.1 defaults to keep-alive unless
/// told otherwise; HTTP/1.0 defaults to close unless told otherwise.
pub fn should_keep_alive(version: &str, headers: &HashMap<String, String>) -> bool {
    match header_value(headers, "connection").as_deref() {
        Some(v) if v.eq_ignore_ascii_case("close") => false,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
        _ => version.contains("1.1"),
    }
}

pub fn header_value(headers: &HashMap<String, String>, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

pub async fn read_http_request<S>(
    stream: &mut S,
    default_scheme: RequestScheme,
) -> anyhow::Result<ParsedRequest>
where
    S: AsyncRead + Unpin,
{
    let (raw_head, buffered_body) = read_message_head(stream).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req.parse(&raw_head)?;
    if status.is_partial() {
        return Err(anyhow!("partial HTTP request"));
    }

    let method_str = req.method.unwrap_or("GET");
    let path_raw = req.path.unwrap_or("/");
    let version = format!("HTTP/1.{}", req.version.unwrap_or(1));
    let headers_vec = headers_from_httparse(req.headers);
    let header_map: HashMap<String, String> = headers_vec.iter().cloned().collect();

    let content_length =
        header_value(&header_map, "content-length").and_then(|v| v.parse::<usize>().ok());
    if let Some(len) = content_length {
        if len > MAX_REQUEST_BODY_BYTES {
            return Err(RequestBodyTooLarge {
                limit: MAX_REQUEST_BODY_BYTES,
            }
            .into());
        }
    }
    let is_chunked = header_value(&header_map, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    let method = HttpMethod::from_str(method_str).unwrap_or(HttpMethod::Other);
    if method == HttpMethod::Connect {
        let (host, port) = split_host_and_port(path_raw, 443);
        return Ok(ParsedRequest {
            method,
            scheme: "https".to_string(),
            host,
            port,
            path: "/".to_string(),
            version,
            headers: headers_vec,
            body_kind: RequestBodyKind::None,
            buffered_body,
        });
    }

    let (scheme, host, port, path) = resolve_target(path_raw, &header_map, default_scheme)?;
    let body_kind = if is_chunked {
        RequestBodyKind::Chunked
    } else if let Some(len) = content_length {
        RequestBodyKind::ContentLength(len)
    } else {
        RequestBodyKind::None
    };

    Ok(ParsedRequest {
        method,
        scheme,
        host,
        port,
        path,
        version,
        headers: headers_vec,
        body_kind,
        buffered_body,
    })
}

pub async fn read_response_head<S>(stream: &mut S) -> anyhow::Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let (raw_head, buffered_body) = read_message_head(stream).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut res = httparse::Response::new(&mut header_storage);
    let status = res.parse(&raw_head)?;
    if status.is_partial() {
        return Err(anyhow!("partial HTTP response"));
    }

    let status_code = res.code.unwrap_or(500);
    let reason = res.reason.unwrap_or("").to_string();
    let headers = headers_from_httparse(res.headers).into_iter().collect();

    Ok(ResponseHead {
        status_code,
        reason,
        headers,
        raw_head,
        body_prefix: buffered_body,
    })
}

pub async fn read_message_head<S>(stream: &mut S) -> anyhow::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(2048);
    let mut temp = [0u8; 4096];

    loop {
        let bytes_read = stream.read(&mut temp).await?;
        if bytes_read == 0 {
            break;
        }
        buffer.extend_from_slice(&temp[..bytes_read]);

        if let Some(pos) = find_header_end(&buffer) {
            let remaining = buffer.split_off(pos);
            return Ok((buffer, remaining));
        }

        if buffer.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("HTTP headers exceed allowed size"));
        }
    }

    Err(anyhow!("connection closed before headers completed"))
}

pub async fn read_exact_body<S>(stream: &mut S, expected_len: usize) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::with_capacity(expected_len);
    let mut remaining = expected_len;

    while remaining > 0 {
        let mut chunk = vec![0u8; remaining.min(8192)];
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(anyhow!("connection closed while reading response body"));
        }
        body.extend_from_slice(&chunk[..read]);
        remaining -= read;
    }

    Ok(body)
}

pub async fn stream_response_body<R, W>(upstream: &mut R, client: &mut W) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    Ok(tokio::io::copy(upstream, client).await?)
}

pub async fn forward_chunked_body<R, W>(
    initial_buffer: Vec<u8>,
    upstream: &mut R,
    client: &mut W,
) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer: VecDeque<u8> = initial_buffer.into();
    let mut total_body_bytes = 0u64;

    loop {
        let line = read_crlf_line(&mut buffer, upstream).await?;
        if line.len() < 2 {
            return Err(anyhow!("invalid chunked encoding: missing CRLF"));
        }
        client.write_all(&line).await?;

        let chunk_size = parse_chunk_size(&line)?;
        if chunk_size == 0 {
            loop {
                let trailer_line = read_crlf_line(&mut buffer, upstream).await?;
                client.write_all(&trailer_line).await?;
                if trailer_line == b"\r\n" {
                    break;
                }
            }
            break;
        }

        let chunk_data = read_exact_from_buffer(&mut buffer, upstream, chunk_size).await?;
        client.write_all(&chunk_data).await?;
        total_body_bytes += chunk_size as u64;

        let crlf = read_exact_from_buffer(&mut buffer, upstream, 2).await?;
        if crlf != b"\r\n" {
            return Err(anyhow!("invalid chunk terminator"));
        }
        client.write_all(&crlf).await?;
    }

    Ok(total_body_bytes)
}

pub async fn forward_fixed_length_body<C, U>(
    client: &mut C,
    upstream: &mut U,
    buffered: &mut Vec<u8>,
    expected_len: usize,
) -> anyhow::Result<()>
where
    C: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    let mut remaining = expected_len;
    if remaining == 0 {
        buffered.clear();
        return Ok(());
    }

    if !buffered.is_empty() {
        let to_take = remaining.min(buffered.len());
        upstream.write_all(&buffered[..to_take]).await?;
        remaining -= to_take;
        buffered.drain(..to_take);
    }

    let mut buf = vec![0u8; 8192];
    while remaining > 0 {
        let read_len = buf.len().min(remaining);
        let n = client.read(&mut buf[..read_len]).await?;
        if n == 0 {
            return Err(anyhow!("connection closed while reading request body"));
        }
        upstream.write_all(&buf[..n]).await?;
        remaining -= n;
    }
    Ok(())
}

pub async fn forward_chunked_request_body<C, U>(
    client: &mut C,
    upstream: &mut U,
    buffered: &mut Vec<u8>,
) -> anyhow::Result<()>
where
    C: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    let mut buffer: VecDeque<u8> = std::mem::take(buffered).into();
    let mut total_bytes: usize = 0;

    loop {
        let line = read_crlf_line(&mut buffer, client).await?;
        if line.len() < 2 {
            return Err(anyhow!("invalid chunk header"));
        }
        upstream.write_all(&line).await?;

        let chunk_size = parse_chunk_size(&line)?;
        if chunk_size == 0 {
            loop {
                let trailer_line = read_crlf_line(&mut buffer, client).await?;
                upstream.write_all(&trailer_line).await?;
                if trailer_line == b"\r\n" {
                    break;
                }
            }
            break;
        }

        total_bytes = total_bytes
            .checked_add(chunk_size)
            .ok_or(RequestBodyTooLarge {
                limit: MAX_REQUEST_BODY_BYTES,
            })?;
        if total_bytes > MAX_REQUEST_BODY_BYTES {
            return Err(RequestBodyTooLarge {
                limit: MAX_REQUEST_BODY_BYTES,
            }
            .into());
        }

        let chunk_data = read_exact_from_buffer(&mut buffer, client, chunk_size).await?;
        upstream.write_all(&chunk_data).await?;

        let crlf = read_exact_from_buffer(&mut buffer, client, 2).await?;
        if crlf != b"\r\n" {
            return Err(anyhow!("invalid chunk terminator"));
        }
        upstream.write_all(&crlf).await?;
    }

    *buffered = buffer.into();
    Ok(())
}

fn parse_chunk_size(line: &[u8]) -> anyhow::Result<usize> {
    let header_bytes = &line[..line.len() - 2];
    let size_token = std::str::from_utf8(header_bytes)
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    usize::from_str_radix(size_token, 16).map_err(|_| anyhow!("invalid chunk size: {size_token}"))
}

async fn read_crlf_line<R>(buffer: &mut VecDeque<u8>, stream: &mut R) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_crlf_in_deque(buffer) {
            let mut line = Vec::with_capacity(pos + 2);
            for _ in 0..=pos + 1 {
                if let Some(b) = buffer.pop_front() {
                    line.push(b);
                }
            }
            return Ok(line);
        }
        fill_buffer(buffer, stream).await?;
    }
}

async fn read_exact_from_buffer<R>(
    buffer: &mut VecDeque<u8>,
    stream: &mut R,
    len: usize,
) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        while let Some(b) = buffer.pop_front() {
            out.push(b);
            if out.len() == len {
                break;
            }
        }
        if out.len() < len {
            fill_buffer(buffer, stream).await?;
        }
    }
    Ok(out)
}

async fn fill_buffer<R>(buffer: &mut VecDeque<u8>, stream: &mut R) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut temp = [0u8; 4096];
    let read = stream.read(&mut temp).await?;
    if read == 0 {
        return Err(anyhow!("connection closed while reading chunked body"));
    }
    buffer.extend(&temp[..read]);
    Ok(())
}

fn find_crlf_in_deque(buffer: &VecDeque<u8>) -> Option<usize> {
    if buffer.len() < 2 {
        return None;
    }
    (0..buffer.len() - 1).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn headers_from_httparse(headers: &[httparse::Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect()
}

pub fn resolve_target(
    raw_path: &str,
    headers: &HashMap<String, String>,
    default_scheme: RequestScheme,
) -> anyhow::Result<(String, String, u16, String)> {
    if raw_path.starts_with("http://") {
        return parse_absolute_target(raw_path, RequestScheme::Http);
    }
    if raw_path.starts_with("https://") {
        return parse_absolute_target(raw_path, RequestScheme::Https);
    }

    let host_header = header_value(headers, "host")
        .ok_or_else(|| anyhow!("missing Host header in HTTP/1.1 request"))?;
    let (host, port) = split_host_and_port(&host_header, default_scheme.default_port());

    Ok((
        default_scheme.as_str().to_string(),
        host,
        port,
        raw_path.to_string(),
    ))
}

pub fn parse_absolute_target(
    target: &str,
    scheme: RequestScheme,
) -> anyhow::Result<(String, String, u16, String)> {
    let without_scheme = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target);
    let (host_port, path_part) = if let Some((host, path)) = without_scheme.split_once('/') {
        (host, format!("/{path}"))
    } else {
        (without_scheme, "/".to_string())
    };

    let (host, port) = split_host_and_port(host_port, scheme.default_port());
    Ok((scheme.as_str().to_string(), host, port, path_part))
}

pub fn split_host_and_port(input: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port)) = input.rsplit_once(':') {
        if let Ok(parsed) = port.parse::<u16>() {
            return (host.to_string(), parsed);
        }
    }
    (input.to_string(), default_port)
}

pub async fn respond_with_status<W>(stream: &mut W, code: u16, message: &str, body: &str) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body_bytes = body.as_bytes();
    let response = format!(
        "HTTP/1.1 {code} {message}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\n{body}",
        body_bytes.len()
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

pub async fn write_request_head<W>(
    writer: &mut W,
    method: &str,
    path: &str,
    version: &str,
    headers: &[(String, String)],
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{method} {path} {version}\r\n").as_bytes())
        .await?;
    for (name, value) in headers {
        writer
            .write_all(format!("{name}: {value}\r\n").as_bytes())
            .await?;
    }
    writer.write_all(b"\r\n").await?;
    Ok(())
}

/// An upstream transport: either plain TCP (origin-form HTTP) or TLS over
/// TCP (MITM'd HTTPS, or a plain-proxy request to an `https://` URL).
#[allow(clippy::large_enum_variant)]
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, data),
            UpstreamStream::Tls(s) => Pin::new(s).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Builds the shared upstream-facing TLS client config: webpki's bundled
/// root store, full verification, TLS 1.2 minimum / 1.3 maximum (rustls
/// 0.23 negotiates within whatever versions the crate was built with,
/// which covers this range by default), ALPN restricted to HTTP/1.1 since
/// this proxy never speaks h2 upstream.
pub fn build_tls_client_config() -> anyhow::Result<ClientConfig> {
    let root_store = RootCertStore::from_iter(TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Dials `host:port`, optionally upgrading to TLS with SNI=`host` when
/// `tls_config` is supplied. `connect_timeout` bounds the TCP handshake;
/// `handshake_timeout` separately bounds the TLS handshake.
pub async fn dial_upstream(
    host: &str,
    port: u16,
    tls_config: Option<Arc<ClientConfig>>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> anyhow::Result<UpstreamStream> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| anyhow!("connect timed out"))?
        .with_context(|| format!("connecting to upstream {host}:{port}"))?;

    let Some(tls_config) = tls_config else {
        return Ok(UpstreamStream::Plain(stream));
    };

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| anyhow!("invalid server name {host}"))?
        .to_owned();
    let connector = TlsConnector::from(tls_config);
    let tls = tokio::time::timeout(handshake_timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| anyhow!("upstream TLS handshake timed out"))??;

    Ok(UpstreamStream::Tls(TlsStream::from(tls)))
}
