use alloy::primitives::{keccak256, Address};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::resolver::ContractInterfaceRecord;

/// Persistence for finished resolution results. A miss and a read failure
/// look the same to the caller; the cache is an accelerator, never a
/// correctness dependency.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<ContractInterfaceRecord>;

    async fn set(&self, key: &str, record: &ContractInterfaceRecord, ttl: Duration);
}

/// Cache key for an extrapolated result. Keyed on the bytecode hash when the
/// bytecode is known, so identical deployments on any chain share one entry;
/// otherwise falls back to the checksummed address plus chain id.
pub fn record_cache_key(chain_id: u64, address: &Address, bytecode: Option<&str>) -> String {
    if let Some(code) = bytecode {
        let trimmed = code.trim_start_matches("0x");
        if let Ok(bytes) = hex::decode(trimmed) {
            if !bytes.is_empty() {
                return format!("extrapolated:bytecode:{}", hex::encode(keccak256(&bytes)));
            }
        }
    }
    format!("extrapolated:{}-{}", address.to_checksum(None), chain_id)
}

#[derive(Serialize, Deserialize)]
struct CacheEnvelope {
    stored_at_secs: u64,
    ttl_secs: u64,
    record: ContractInterfaceRecord,
}

/// File-per-entry cache under the platform cache directory.
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(config: &CacheConfig) -> Self {
        let dir = config
            .dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|base| base.join("abiscope")))
            .unwrap_or_else(|| PathBuf::from(".abiscope-cache"));
        Self { dir }
    }

    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        // Keys carry ':' separators, which are not portable filename bytes.
        let sanitized: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", sanitized))
    }
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[async_trait]
impl ResultCache for DiskCache {
    async fn get(&self, key: &str) -> Option<ContractInterfaceRecord> {
        let path = self.entry_path(key);
        let raw = tokio::fs::read(&path).await.ok()?;
        let envelope: CacheEnvelope = match serde_json::from_slice(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Discarding unreadable cache entry {}: {}", path.display(), e);
                let _ = tokio::fs::remove_file(&path).await;
                return None;
            }
        };

        let age = epoch_secs(SystemTime::now()).saturating_sub(envelope.stored_at_secs);
        if age > envelope.ttl_secs {
            debug!("Cache entry for {} expired ({}s old)", key, age);
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }

        debug!("Cache hit for {}", key);
        Some(envelope.record)
    }

    async fn set(&self, key: &str, record: &ContractInterfaceRecord, ttl: Duration) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!("Could not create cache directory {}: {}", self.dir.display(), e);
            return;
        }

        let envelope = CacheEnvelope {
            stored_at_secs: epoch_secs(SystemTime::now()),
            ttl_secs: ttl.as_secs(),
            record: record.clone(),
        };

        let path = self.entry_path(key);
        match serde_json::to_vec(&envelope) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!("Could not write cache entry {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("Could not serialize cache entry for {}: {}", key, e),
        }
    }
}
