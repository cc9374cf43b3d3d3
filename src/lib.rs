//! GoSniffer: a forward HTTP/HTTPS proxy with TLS MITM interception via a
//! locally-managed root CA.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        gosniffer (CLI)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │  config   │ logger  │ shutdown │          cert            │
//! │  (clap)   │(tracing)│(drain +  │  ca / leaf / cache       │
//! │           │         │ cancel)  │  (rcgen, rustls, rsa)    │
//! ├──────────────────────────────────────────────────────────┤
//! │                          proxy                            │
//! │  server (accept loop) ── http (plain relay)                │
//! │                       └── mitm (TLS interception) ── websocket │
//! │                       wire (shared parsing/forwarding)     │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod cert;
pub mod config;
pub mod error;
pub mod logger;
pub mod proxy;
pub mod shutdown;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
