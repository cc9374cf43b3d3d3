//! HTTP/HTTPS forward proxy: accept loop, plain-HTTP relay, TLS-MITM
//! interception, and opaque WebSocket tunneling.

pub mod http;
pub mod mitm;
pub mod server;
pub mod websocket;
pub mod wire;

pub use server::run;
