//! The per-node contract of the content store.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to a single store endpoint.
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("not pinned")]
    NotPinned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// One content-addressed storage node.
#[async_trait]
pub trait StoreEndpoint: Send + Sync {
    /// Base URL, used to label results.
    fn url(&self) -> &str;

    /// Store the file without pinning it and return its content address.
    async fn add(&self, path: &Path) -> Result<String, EndpointError>;

    async fn pin_add(&self, address: &str) -> Result<(), EndpointError>;

    /// Whether `address` is pinned recursively on this node.
    async fn is_pinned(&self, address: &str) -> Result<bool, EndpointError>;

    /// Remove a pin. Returns [`EndpointError::NotPinned`] when there was none.
    async fn pin_rm(&self, address: &str) -> Result<(), EndpointError>;

    /// Peer identity of the node, used as a health probe.
    async fn identity(&self) -> Result<String, EndpointError>;

    /// Stream the content at `address` into `dest`, returning the byte count.
    async fn fetch(&self, address: &str, dest: &Path) -> Result<u64, EndpointError>;
}
