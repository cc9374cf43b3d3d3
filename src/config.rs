//! Command-line configuration.
//!
//! This is the thin external front-end: flag parsing, PEM path defaulting,
//! and the key-algorithm choice. Everything downstream takes a plain
//! [`Config`] value.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::cert::ca::KeyAlgorithm;
use crate::error::ProxyError;

#[derive(Debug, Parser)]
#[command(name = "gosniffer", about = "Forward HTTP/HTTPS proxy with TLS MITM inspection")]
pub struct Cli {
    /// Address to listen on, e.g. 127.0.0.1:8080 or :8080
    #[arg(long = "listen", default_value = ":8080")]
    pub listen: String,

    /// Path to the CA certificate PEM file
    #[arg(long = "ca-cert")]
    pub ca_cert: Option<PathBuf>,

    /// Path to the CA private key PEM file
    #[arg(long = "ca-key")]
    pub ca_key: Option<PathBuf>,

    /// Deadline for draining in-flight connections on shutdown
    #[arg(long = "shutdown-timeout", default_value = "30s")]
    pub shutdown_timeout: String,

    /// Disable HTTPS interception (CONNECT tunnels become opaque byte relays)
    #[arg(long = "disable-https", default_value_t = false)]
    pub disable_https: bool,

    /// CA key algorithm: rsa or ecdsa
    #[arg(long = "key-algorithm", default_value = "rsa")]
    pub key_algorithm: String,
}

/// Resolved, validated runtime configuration.
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    pub shutdown_timeout: Duration,
    pub enable_https: bool,
    pub key_algorithm: KeyAlgorithm,
}

impl Config {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let (bind_address, port) = split_listen_address(&cli.listen)?;
        let key_algorithm = KeyAlgorithm::from_str(&cli.key_algorithm).map_err(|_| {
            ProxyError::Configuration(format!(
                "unsupported key algorithm '{}', expected 'rsa' or 'ecdsa'",
                cli.key_algorithm
            ))
        })?;

        let default_dir = default_storage_dir();
        let ca_cert_path = cli
            .ca_cert
            .unwrap_or_else(|| default_dir.join("ca-cert.pem"));
        let ca_key_path = cli
            .ca_key
            .unwrap_or_else(|| default_dir.join("ca-key.pem"));

        let shutdown_timeout = parse_duration(&cli.shutdown_timeout).ok_or_else(|| {
            ProxyError::Configuration(format!(
                "invalid shutdown timeout '{}', expected e.g. '30s'",
                cli.shutdown_timeout
            ))
        })?;

        Ok(Self {
            bind_address,
            port,
            ca_cert_path,
            ca_key_path,
            shutdown_timeout,
            enable_https: !cli.disable_https,
            key_algorithm,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// `<home>/.gosniffer` by default; falls back to the current directory if
/// the platform has no resolvable home (documented in DESIGN.md).
fn default_storage_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gosniffer")
}

fn split_listen_address(listen: &str) -> anyhow::Result<(String, u16)> {
    if let Some(port_str) = listen.strip_prefix(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|_| ProxyError::Configuration(format!("invalid port in '{listen}'")))?;
        return Ok(("0.0.0.0".to_string(), port));
    }

    let (host, port_str) = listen
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::Configuration(format!("missing port in '{listen}'")))?;
    let port = port_str
        .parse::<u16>()
        .map_err(|_| ProxyError::Configuration(format!("invalid port in '{listen}'")))?;
    Ok((host.to_string(), port))
}

/// Parses a small subset of Go-style duration strings (`30s`, `500ms`, `2m`)
/// since that is the vocabulary the default shutdown timeout uses.
fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    let split_at = input.find(|c: char| !c.is_ascii_digit())?;
    let (value, unit) = input.split_at(split_at);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        _ => None,
    }
}
