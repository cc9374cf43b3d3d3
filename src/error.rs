//! Structured error kinds for the pieces of the proxy that need to report
//! a specific disposition (exit code, HTTP status) rather than just bubble
//! up through `anyhow`.

use thiserror::Error;

/// Top-level error kinds, mirroring the disposition table the proxy follows
/// when something goes wrong. Most call sites still return `anyhow::Result`
/// and attach one of these with `.context(...)` or `?`; `main` matches on
/// the downcast to decide the process exit code.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("CA I/O error: {0}")]
    CaIo(String),

    #[error("key strength violation: {0}")]
    KeyStrength(String),

    #[error("upstream transport error for {host}: {source}")]
    UpstreamTransport {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("certificate generation failed for {host}: {source}")]
    CertGeneration {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("client TLS handshake failed for {host}: {source}")]
    ClientTlsHandshake {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("upstream TLS verification failed for {host}: {source}")]
    UpstreamTlsVerify {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed inner HTTP message for {host}: {source}")]
    InnerHttpParse {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("connection does not support hijacking")]
    Hijack,

    #[error("shutdown timed out with {remaining} handler(s) still running")]
    ShutdownDrain { remaining: usize },
}

/// Classifies an error as a benign client-initiated disconnect (broken pipe,
/// reset, write-on-closed-socket) — these are never
/// logged as errors, only at debug level.
pub fn is_client_disconnect(err: &anyhow::Error) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("broken pipe")
        || text.contains("connection reset")
        || text.contains("connection closed")
        || text.contains("eof")
        || text.contains("not connected")
}
