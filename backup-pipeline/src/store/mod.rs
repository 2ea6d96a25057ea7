//! Replicated content store client.
//!
//! Uploads go to the primary (first) endpoint, then every endpoint is asked
//! to pin the content concurrently. An upload only succeeds when at least
//! `replication_factor` endpoints confirm the pin.

pub mod endpoint;
pub mod ipfs;
#[cfg(test)]
pub(crate) mod testing;

pub use endpoint::{EndpointError, StoreEndpoint};
pub use ipfs::IpfsHttpEndpoint;

use crate::config::StoreConfig;
use crate::utils::{BackupError, Result};
use futures_util::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of pinning on one endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PinResult {
    pub endpoint: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub content_address: String,
    pub size_bytes: u64,
    pub pin_results: Vec<PinResult>,
}

impl UploadOutcome {
    pub fn pinned_count(&self) -> usize {
        self.pin_results.iter().filter(|r| r.success).count()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PinStatus {
    pub endpoint: String,
    pub pinned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PinVerification {
    pub content_address: String,
    pub all_pinned: bool,
    pub endpoints: Vec<PinStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpinResult {
    pub endpoint: String,
    pub success: bool,
    pub already_unpinned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointHealth {
    pub endpoint: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ReplicatedStore {
    endpoints: Vec<Arc<dyn StoreEndpoint>>,
    replication_factor: usize,
    pin_timeout: Duration,
    verify_timeout: Duration,
}

impl std::fmt::Debug for ReplicatedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedStore")
            .field("endpoints", &self.endpoint_urls())
            .field("replication_factor", &self.replication_factor)
            .finish()
    }
}

impl ReplicatedStore {
    pub fn new(
        endpoints: Vec<Arc<dyn StoreEndpoint>>,
        replication_factor: usize,
        pin_timeout: Duration,
        verify_timeout: Duration,
    ) -> Result<Self> {
        if replication_factor == 0 || replication_factor > endpoints.len() {
            return Err(BackupError::Config(format!(
                "replication factor {} must be between 1 and the {} configured endpoints",
                replication_factor,
                endpoints.len()
            )));
        }
        Ok(Self {
            endpoints,
            replication_factor,
            pin_timeout,
            verify_timeout,
        })
    }

    /// Build Kubo HTTP endpoints from configuration.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let endpoints = config
            .endpoints
            .iter()
            .map(|url| {
                IpfsHttpEndpoint::new(url.as_str())
                    .map(|e| Arc::new(e) as Arc<dyn StoreEndpoint>)
                    .map_err(|e| BackupError::Config(format!("invalid endpoint {}: {}", url, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(
            endpoints,
            config.replication_factor,
            Duration::from_secs(config.pin_timeout_secs),
            Duration::from_secs(config.verify_timeout_secs),
        )
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn endpoint_urls(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.url().to_string()).collect()
    }

    /// Add `path` to the primary endpoint and pin it on every endpoint.
    pub async fn upload(&self, path: &Path) -> Result<UploadOutcome> {
        let size_bytes = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return Err(BackupError::Store(format!("not a regular file: {}", path.display())))
            }
            Err(e) => {
                return Err(BackupError::Store(format!("cannot read {}: {}", path.display(), e)))
            }
        };
        if size_bytes == 0 {
            return Err(BackupError::Store(format!("refusing to upload empty file {}", path.display())));
        }

        let primary = &self.endpoints[0];
        tracing::info!(file = %path.display(), endpoint = primary.url(), size_bytes, "Uploading to primary endpoint");
        let content_address = primary
            .add(path)
            .await
            .map_err(|e| BackupError::Store(format!("add on {} failed: {}", primary.url(), e)))?;

        let pin_results = self.pin_everywhere(&content_address).await;
        let achieved = pin_results.iter().filter(|r| r.success).count();
        if achieved < self.replication_factor {
            tracing::error!(
                address = %content_address,
                required = self.replication_factor,
                achieved,
                "Replication requirement not met"
            );
            return Err(BackupError::InsufficientReplication {
                required: self.replication_factor,
                achieved,
            });
        }

        tracing::info!(address = %content_address, pinned = achieved, total = self.endpoints.len(), "Upload replicated");
        Ok(UploadOutcome {
            content_address,
            size_bytes,
            pin_results,
        })
    }

    /// Pin `address` on every endpoint concurrently. Never fails as a whole.
    pub async fn pin_everywhere(&self, address: &str) -> Vec<PinResult> {
        let calls = self.endpoints.iter().map(|endpoint| async move {
            let result = bounded(self.pin_timeout, endpoint.pin_add(address)).await;
            match result {
                Ok(()) => PinResult {
                    endpoint: endpoint.url().to_string(),
                    success: true,
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(endpoint = endpoint.url(), address, error = %e, "Pin failed");
                    PinResult {
                        endpoint: endpoint.url().to_string(),
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            }
        });
        join_all(calls).await
    }

    /// Audit whether every endpoint still holds a pin for `address`.
    pub async fn verify_pin(&self, address: &str) -> PinVerification {
        let calls = self.endpoints.iter().map(|endpoint| async move {
            match bounded(self.verify_timeout, endpoint.is_pinned(address)).await {
                Ok(pinned) => PinStatus {
                    endpoint: endpoint.url().to_string(),
                    pinned,
                    error: None,
                },
                Err(e) => PinStatus {
                    endpoint: endpoint.url().to_string(),
                    pinned: false,
                    error: Some(e.to_string()),
                },
            }
        });
        let endpoints = join_all(calls).await;
        PinVerification {
            content_address: address.to_string(),
            all_pinned: endpoints.iter().all(|s| s.pinned),
            endpoints,
        }
    }

    /// Remove the pin everywhere. "Not pinned" counts as success.
    pub async fn unpin(&self, address: &str) -> Vec<UnpinResult> {
        let calls = self.endpoints.iter().map(|endpoint| async move {
            let url = endpoint.url().to_string();
            match bounded(self.pin_timeout, endpoint.pin_rm(address)).await {
                Ok(()) => UnpinResult {
                    endpoint: url,
                    success: true,
                    already_unpinned: false,
                    error: None,
                },
                Err(EndpointError::NotPinned) => UnpinResult {
                    endpoint: url,
                    success: true,
                    already_unpinned: true,
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(endpoint = %url, address, error = %e, "Unpin failed");
                    UnpinResult {
                        endpoint: url,
                        success: false,
                        already_unpinned: false,
                        error: Some(e.to_string()),
                    }
                }
            }
        });
        join_all(calls).await
    }

    /// Fetch `address` into `dest`, trying endpoints in configured order.
    pub async fn download(&self, address: &str, dest: &Path) -> Result<u64> {
        let mut failures = Vec::new();
        for endpoint in &self.endpoints {
            match endpoint.fetch(address, dest).await {
                Ok(bytes) => {
                    tracing::info!(address, endpoint = endpoint.url(), bytes, "Downloaded");
                    return Ok(bytes);
                }
                Err(e) => {
                    tracing::warn!(address, endpoint = endpoint.url(), error = %e, "Download attempt failed");
                    failures.push(format!("{}: {}", endpoint.url(), e));
                }
            }
        }
        Err(BackupError::Store(format!(
            "could not download {} from any endpoint ({})",
            address,
            failures.join("; ")
        )))
    }

    /// Probe every endpoint's identity.
    pub async fn check_health(&self) -> Vec<EndpointHealth> {
        let calls = self.endpoints.iter().map(|endpoint| async move {
            match bounded(self.verify_timeout, endpoint.identity()).await {
                Ok(peer_id) => EndpointHealth {
                    endpoint: endpoint.url().to_string(),
                    healthy: true,
                    peer_id: Some(peer_id),
                    error: None,
                },
                Err(e) => EndpointHealth {
                    endpoint: endpoint.url().to_string(),
                    healthy: false,
                    peer_id: None,
                    error: Some(e.to_string()),
                },
            }
        });
        join_all(calls).await
    }
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = std::result::Result<T, EndpointError>>,
) -> std::result::Result<T, EndpointError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(EndpointError::Timeout(limit)),
    }
}
