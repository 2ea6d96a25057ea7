//! Kubo RPC client implementing [`StoreEndpoint`].

use super::endpoint::{EndpointError, StoreEndpoint};
use crate::transfer::format_bytes;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Response};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;

const READ_CHUNK: usize = 64 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Error body returned by the Kubo RPC API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddResponse {
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PinLsResponse {
    #[serde(default)]
    keys: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    #[serde(rename = "ID")]
    id: String,
}

/// A Kubo node reached over its HTTP RPC port.
#[derive(Debug, Clone)]
pub struct IpfsHttpEndpoint {
    base_url: String,
    client: Client,
}

impl IpfsHttpEndpoint {
    pub fn new(base_url: impl Into<String>) -> Result<Self, EndpointError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    fn rpc(&self, command: &str) -> String {
        format!("{}/api/v0/{}", self.base_url, command)
    }

    async fn call(&self, command: &str, query: &[(&str, &str)]) -> Result<Response, EndpointError> {
        let response = self.client.post(self.rpc(command)).query(query).send().await?;
        check_status(response).await
    }
}

/// Bytes sent so far for one upload body, logged at debug level.
struct UploadProgress {
    label: String,
    total: u64,
    sent: u64,
    last_report: Option<Instant>,
    interval: Duration,
}

impl UploadProgress {
    fn new(label: String, total: u64, interval: Duration) -> Self {
        Self {
            label,
            total,
            sent: 0,
            last_report: None,
            interval,
        }
    }

    /// Count `n` more bytes. Returns true when a progress line was logged.
    fn advance(&mut self, n: usize) -> bool {
        self.sent += n as u64;
        let now = Instant::now();
        let due = self.sent >= self.total
            || self.last_report.map_or(true, |at| now.duration_since(at) >= self.interval);
        if !due {
            return false;
        }
        self.last_report = Some(now);
        let percent = if self.total > 0 {
            self.sent as f64 * 100.0 / self.total as f64
        } else {
            100.0
        };
        tracing::debug!(
            file = %self.label,
            sent = %format_bytes(self.sent),
            total = %format_bytes(self.total),
            "Upload progress {:.1}%",
            percent
        );
        true
    }
}

/// Feed every chunk that leaves `body` through `progress`.
fn with_progress<S, E>(body: S, mut progress: UploadProgress) -> impl Stream<Item = Result<bytes::Bytes, E>>
where
    S: Stream<Item = Result<bytes::Bytes, E>>,
{
    body.map(move |chunk| {
        if let Ok(bytes) = &chunk {
            progress.advance(bytes.len());
        }
        chunk
    })
}

/// Map non-2xx responses onto [`EndpointError`], recognising "not pinned".
async fn check_status(response: Response) -> Result<Response, EndpointError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<RpcError>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    if message.contains("not pinned") {
        return Err(EndpointError::NotPinned);
    }
    Err(EndpointError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl StoreEndpoint for IpfsHttpEndpoint {
    fn url(&self) -> &str {
        &self.base_url
    }

    async fn add(&self, path: &Path) -> Result<String, EndpointError> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup".to_string());

        let progress = UploadProgress::new(file_name.clone(), len, PROGRESS_INTERVAL);
        let body = with_progress(ReaderStream::with_capacity(file, READ_CHUNK), progress);
        let part = Part::stream_with_length(Body::wrap_stream(body), len).file_name(file_name);
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(self.rpc("add"))
            .query(&[("pin", "false"), ("cid-version", "1")])
            .multipart(form)
            .send()
            .await?;
        let body = check_status(response).await?.text().await?;

        // One JSON object per line; the last one describes the root
        let last = body
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| EndpointError::Protocol("empty add response".to_string()))?;
        let added: AddResponse = serde_json::from_str(last)
            .map_err(|e| EndpointError::Protocol(format!("bad add response: {}", e)))?;
        Ok(added.hash)
    }

    async fn pin_add(&self, address: &str) -> Result<(), EndpointError> {
        self.call("pin/add", &[("arg", address)]).await?;
        Ok(())
    }

    async fn is_pinned(&self, address: &str) -> Result<bool, EndpointError> {
        let response = match self
            .call("pin/ls", &[("arg", address), ("type", "recursive")])
            .await
        {
            Ok(r) => r,
            Err(EndpointError::NotPinned) => return Ok(false),
            Err(e) => return Err(e),
        };
        let listing: PinLsResponse = response
            .json()
            .await
            .map_err(|e| EndpointError::Protocol(format!("bad pin/ls response: {}", e)))?;
        Ok(!listing.keys.is_empty())
    }

    async fn pin_rm(&self, address: &str) -> Result<(), EndpointError> {
        self.call("pin/rm", &[("arg", address)]).await?;
        Ok(())
    }

    async fn identity(&self) -> Result<String, EndpointError> {
        let id: IdResponse = self
            .call("id", &[])
            .await?
            .json()
            .await
            .map_err(|e| EndpointError::Protocol(format!("bad id response: {}", e)))?;
        Ok(id.id)
    }

    async fn fetch(&self, address: &str, dest: &Path) -> Result<u64, EndpointError> {
        let response = self.call("cat", &[("arg", address)]).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        let result: Result<(), EndpointError> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(e);
        }
        Ok(written)
    }
}
