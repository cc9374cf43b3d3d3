//! Certificate authority lifecycle, leaf minting, and the leaf cache.

pub mod ca;
pub mod cache;
pub mod leaf;

pub use ca::{KeyAlgorithm, RootCa};
pub use cache::CertificateCache;
pub use leaf::LeafBundle;
