//! In-memory store endpoints for tests.

use super::endpoint::{EndpointError, StoreEndpoint};
use super::ReplicatedStore;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Blocks reachable from every memory endpoint, like a swarm.
pub type MemoryNetwork = Arc<Mutex<HashMap<String, Vec<u8>>>>;

pub struct MemoryEndpoint {
    url: String,
    network: MemoryNetwork,
    pins: Mutex<HashSet<String>>,
    /// pin/add fails
    pub fail_pins: AtomicBool,
    /// every call fails
    pub offline: AtomicBool,
    /// pin/add sleeps this long first
    pub pin_delay: Mutex<Option<Duration>>,
}

impl MemoryEndpoint {
    pub fn new(url: &str, network: MemoryNetwork) -> Self {
        Self {
            url: url.to_string(),
            network,
            pins: Mutex::new(HashSet::new()),
            fail_pins: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            pin_delay: Mutex::new(None),
        }
    }

    pub fn has_pin(&self, address: &str) -> bool {
        self.pins.lock().unwrap().contains(address)
    }

    pub fn pinned(&self) -> Vec<String> {
        self.pins.lock().unwrap().iter().cloned().collect()
    }

    fn check_online(&self) -> Result<(), EndpointError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EndpointError::Protocol(format!("{} is offline", self.url)));
        }
        Ok(())
    }
}

pub fn content_address(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("bafymem{:016x}", hasher.finish())
}

#[async_trait]
impl StoreEndpoint for MemoryEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn add(&self, path: &Path) -> Result<String, EndpointError> {
        self.check_online()?;
        let bytes = tokio::fs::read(path).await?;
        let address = content_address(&bytes);
        self.network.lock().unwrap().insert(address.clone(), bytes);
        Ok(address)
    }

    async fn pin_add(&self, address: &str) -> Result<(), EndpointError> {
        self.check_online()?;
        let delay = *self.pin_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_pins.load(Ordering::SeqCst) {
            return Err(EndpointError::Api {
                status: 500,
                message: "pin failed".to_string(),
            });
        }
        if !self.network.lock().unwrap().contains_key(address) {
            return Err(EndpointError::Protocol(format!("unknown block {}", address)));
        }
        self.pins.lock().unwrap().insert(address.to_string());
        Ok(())
    }

    async fn is_pinned(&self, address: &str) -> Result<bool, EndpointError> {
        self.check_online()?;
        Ok(self.has_pin(address))
    }

    async fn pin_rm(&self, address: &str) -> Result<(), EndpointError> {
        self.check_online()?;
        if self.pins.lock().unwrap().remove(address) {
            Ok(())
        } else {
            Err(EndpointError::NotPinned)
        }
    }

    async fn identity(&self) -> Result<String, EndpointError> {
        self.check_online()?;
        Ok(format!("peer-{}", self.url))
    }

    async fn fetch(&self, address: &str, dest: &Path) -> Result<u64, EndpointError> {
        self.check_online()?;
        let bytes = self
            .network
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| EndpointError::Protocol(format!("unknown block {}", address)))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}

/// A store over `count` memory endpoints sharing one network.
pub fn memory_store(count: usize, replication_factor: usize) -> (ReplicatedStore, Vec<Arc<MemoryEndpoint>>) {
    let network = MemoryNetwork::default();
    let nodes: Vec<Arc<MemoryEndpoint>> = (0..count)
        .map(|i| Arc::new(MemoryEndpoint::new(&format!("mem://node-{}", i + 1), network.clone())))
        .collect();
    let endpoints = nodes
        .iter()
        .map(|n| n.clone() as Arc<dyn StoreEndpoint>)
        .collect();
    let store = ReplicatedStore::new(
        endpoints,
        replication_factor,
        Duration::from_millis(500),
        Duration::from_millis(500),
    )
    .unwrap();
    (store, nodes)
}
