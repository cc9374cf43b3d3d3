//! Sanitizing logger.
//!
//! Every free-text field that reaches a log line — hostnames pulled off
//! the wire, error contexts — is passed through [`sanitize`] first. No
//! caller may log a header value, body, key, or token; the call sites in
//! `proxy::http`/`proxy::mitm` only ever pass hostnames and fixed labels.

const DNS_MAX_LEN: usize = 253;

/// Strips CR/LF/TAB and other ASCII control characters (0x00-0x1F, 0x7F)
/// and truncates to the DNS max length, so a malicious `Host` header can't
/// inject fake log lines or blow up the sink.
pub fn sanitize(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_control())
        .collect();
    if cleaned.len() > DNS_MAX_LEN {
        cleaned.chars().take(DNS_MAX_LEN).collect()
    } else {
        cleaned
    }
}

/// Logs a completed request: `[timestamp] <hostname> - <status>`.
pub fn request(hostname: &str, status: u16) {
    let host = sanitize(hostname);
    tracing::info!(target: "audit", "{} - {}", host, status);
}

/// Logs a free-text informational line.
pub fn info(msg: &str) {
    tracing::info!(target: "audit", "{}", sanitize(msg));
}

/// Logs an error with its operation context; the cause chain is preserved
/// by `anyhow`/`thiserror`'s `Display`, which already elides secrets since
/// nothing secret is ever wrapped into these errors.
pub fn error(context: &str, err: &anyhow::Error) {
    tracing::error!(target: "audit", "{}: {}", sanitize(context), err);
}

/// Logs a freshly minted leaf certificate's fingerprint.
pub fn cert(hostname: &str, fingerprint: &str) {
    tracing::info!(
        target: "audit",
        "Generated cert for {} fingerprint: {}",
        sanitize(hostname),
        fingerprint
    );
}

/// Installs the process-wide `tracing` subscriber. Honors `RUST_LOG`,
/// defaulting to `info` when unset.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_control_characters() {
        let out = sanitize("a\r\nb\tc");
        assert!(!out.contains('\r'));
        assert!(!out.contains('\n'));
        assert!(!out.contains('\t'));
        assert_eq!(out, "abc");
    }

    #[test]
    fn sanitize_truncates_to_dns_max() {
        let long = "a".repeat(400);
        let out = sanitize(&long);
        assert_eq!(out.len(), DNS_MAX_LEN);
    }

    #[test]
    fn sanitize_strips_delete_byte() {
        let out = sanitize("host\u{7f}name");
        assert_eq!(out, "hostname");
    }
}
