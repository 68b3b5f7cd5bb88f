use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{ChainEndpointSet, ExplorerLink, NativeCurrency};
use crate::config::ChainlistConfig;
use crate::error::{ResolveError, Result};

/// Registry of supported chains and their endpoint sets.
///
/// The table is built once per process (lazily, on first access) by
/// aggregating the canonical chain list with per-chain metadata, probing every
/// candidate RPC URL for liveness and keeping only chains that end up with at
/// least one working endpoint. Concurrent first callers share a single
/// in-flight load instead of issuing duplicate network work.
pub struct ChainRegistry {
    client: Client,
    config: ChainlistConfig,
    table: RwLock<Option<Arc<HashMap<u64, ChainEndpointSet>>>>,
    load_gate: Mutex<()>,
    probe_cache: Arc<Mutex<HashMap<String, ProbeVerdict>>>,
}

#[derive(Debug, Clone, Copy)]
struct ProbeVerdict {
    healthy: bool,
    checked_at: Instant,
}

#[derive(Debug, Deserialize)]
struct ChainListEnvelope {
    result: Vec<ChainListEntry>,
}

#[derive(Debug, Deserialize)]
struct ChainListEntry {
    chainid: String,
}

#[derive(Debug, Deserialize)]
struct PageDataEnvelope {
    result: PageDataResult,
}

#[derive(Debug, Deserialize)]
struct PageDataResult {
    data: PageData,
}

#[derive(Debug, Deserialize)]
struct PageData {
    chain: ChainMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainMetadata {
    chain_id: u64,
    name: String,
    #[serde(default)]
    rpc: Vec<String>,
    native_currency: NativeCurrency,
    #[serde(default)]
    explorers: Option<Vec<ExplorerLink>>,
    #[serde(default)]
    icon: Option<IconMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IconMetadata {
    #[serde(rename = "publicURL")]
    public_url: String,
}

impl ChainRegistry {
    pub fn new(client: Client, config: ChainlistConfig) -> Self {
        Self {
            client,
            config,
            table: RwLock::new(None),
            load_gate: Mutex::new(()),
            probe_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Loads the chain table if it has not been loaded yet. Idempotent;
    /// concurrent callers block on the same in-flight load.
    pub async fn load(&self) -> Result<()> {
        if self.table.read().await.is_some() {
            return Ok(());
        }

        let _gate = self.load_gate.lock().await;
        // A concurrent caller may have finished the load while we waited.
        if self.table.read().await.is_some() {
            return Ok(());
        }

        let table = self.build_table().await?;
        info!("Chain registry loaded with {} supported chains", table.len());
        *self.table.write().await = Some(Arc::new(table));
        Ok(())
    }

    /// Discards the cached table and loads it again.
    pub async fn reload(&self) -> Result<()> {
        let _gate = self.load_gate.lock().await;
        let table = self.build_table().await?;
        info!("Chain registry reloaded with {} supported chains", table.len());
        *self.table.write().await = Some(Arc::new(table));
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ChainEndpointSet>> {
        self.load().await?;
        let guard = self.table.read().await;
        let table = guard
            .as_ref()
            .ok_or_else(|| ResolveError::ExplorerQueryFailed("chain registry not loaded".into()))?;
        Ok(table.values().cloned().collect())
    }

    pub async fn get(&self, chain_id: u64) -> Result<ChainEndpointSet> {
        self.load().await?;
        let guard = self.table.read().await;
        let table = guard
            .as_ref()
            .ok_or_else(|| ResolveError::ExplorerQueryFailed("chain registry not loaded".into()))?;
        table
            .get(&chain_id)
            .cloned()
            .ok_or(ResolveError::UnsupportedChain(chain_id))
    }

    pub async fn rpc_urls(&self, chain_id: u64) -> Result<Vec<String>> {
        Ok(self.get(chain_id).await?.rpc_urls)
    }

    pub async fn icon(&self, chain_id: u64) -> Result<Option<String>> {
        Ok(self.get(chain_id).await?.icon_url)
    }

    async fn build_table(&self) -> Result<HashMap<u64, ChainEndpointSet>> {
        let chain_ids = self.fetch_chain_list().await?;
        debug!("Chain list advertises {} chains", chain_ids.len());

        let mut metadata = Vec::new();
        let mut set = JoinSet::new();
        for chain_id in chain_ids {
            let client = self.client.clone();
            let config = self.config.clone();
            set.spawn(async move { fetch_chain_metadata(&client, &config, chain_id).await });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(meta)) => metadata.push(meta),
                // Chains whose metadata fetch fails are dropped, not fatal.
                Ok(Err(e)) => debug!("Dropping chain with failed metadata fetch: {}", e),
                Err(e) => warn!("Chain metadata task failed: {}", e),
            }
        }

        let mut table = HashMap::new();
        let mut probes = JoinSet::new();
        for meta in metadata {
            let client = self.client.clone();
            let config = self.config.clone();
            let cache = Arc::clone(&self.probe_cache);
            probes.spawn(async move {
                let candidates = candidate_rpc_urls(&meta.rpc);
                let live = filter_live_endpoints(&client, &config, cache, candidates).await;
                (meta, live)
            });
        }
        while let Some(joined) = probes.join_next().await {
            let (meta, live) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("RPC probe task failed: {}", e);
                    continue;
                }
            };
            if live.is_empty() {
                debug!("Dropping chain {} ({}): no live RPC endpoints", meta.chain_id, meta.name);
                continue;
            }
            let icon_url = meta
                .icon
                .as_ref()
                .map(|icon| format!("{}/{}", self.config.chainid_base, icon.public_url));
            table.insert(
                meta.chain_id,
                ChainEndpointSet {
                    chain_id: meta.chain_id,
                    name: meta.name,
                    rpc_urls: live,
                    native_currency: meta.native_currency,
                    explorers: meta.explorers.unwrap_or_default(),
                    icon_url,
                },
            );
        }

        Ok(table)
    }

    async fn fetch_chain_list(&self) -> Result<Vec<u64>> {
        let url = format!("{}/v2/chainlist", self.config.etherscan_base);
        let client = self.client.clone();
        let envelope: ChainListEnvelope = with_retry(
            self.config.fetch_retries,
            Duration::from_millis(self.config.retry_delay_ms),
            "chain list fetch",
            || async {
                let response = client.get(&url).send().await?.error_for_status()?;
                Ok(response.json().await?)
            },
        )
        .await?;

        Ok(envelope
            .result
            .iter()
            .filter_map(|entry| entry.chainid.parse::<u64>().ok())
            .collect())
    }
}

/// Rejects RPC URL templates that still contain credential placeholders.
fn candidate_rpc_urls(urls: &[String]) -> Vec<String> {
    urls.iter()
        .filter(|url| !url.contains("${"))
        .cloned()
        .collect()
}

async fn fetch_chain_metadata(
    client: &Client,
    config: &ChainlistConfig,
    chain_id: u64,
) -> Result<ChainMetadata> {
    let url = format!(
        "{}/page-data/chain/{}/page-data.json",
        config.chainid_base, chain_id
    );
    let envelope: PageDataEnvelope = with_retry(
        config.fetch_retries,
        Duration::from_millis(config.retry_delay_ms),
        "chain metadata fetch",
        || async {
            let response = client.get(&url).send().await?.error_for_status()?;
            Ok(response.json().await?)
        },
    )
    .await?;
    Ok(envelope.result.data.chain)
}

/// Probes the candidate URLs in parallel and keeps the responsive ones.
async fn filter_live_endpoints(
    client: &Client,
    config: &ChainlistConfig,
    cache: Arc<Mutex<HashMap<String, ProbeVerdict>>>,
    candidates: Vec<String>,
) -> Vec<String> {
    let mut set = JoinSet::new();
    for url in candidates {
        let client = client.clone();
        let cache = Arc::clone(&cache);
        let timeout = Duration::from_millis(config.probe_timeout_ms);
        let cache_ttl = Duration::from_secs(config.probe_cache_secs);
        set.spawn(async move {
            let healthy = probe_endpoint(&client, &url, timeout, cache, cache_ttl).await;
            (url, healthy)
        });
    }

    let mut live = Vec::new();
    while let Some(joined) = set.join_next().await {
        if let Ok((url, true)) = joined {
            live.push(url);
        }
    }
    live.sort();
    live
}

/// Minimal liveness probe: `eth_blockNumber` must answer with a result within
/// the timeout. Verdicts are cached per URL for the configured duration so a
/// session does not re-probe on every lookup.
async fn probe_endpoint(
    client: &Client,
    url: &str,
    timeout: Duration,
    cache: Arc<Mutex<HashMap<String, ProbeVerdict>>>,
    cache_ttl: Duration,
) -> bool {
    {
        let cache = cache.lock().await;
        if let Some(verdict) = cache.get(url) {
            if verdict.checked_at.elapsed() < cache_ttl {
                return verdict.healthy;
            }
        }
    }

    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "eth_blockNumber",
        "params": [],
        "id": 1,
    });

    let healthy = match client.post(url).timeout(timeout).json(&body).send().await {
        Ok(response) if response.status().is_success() => match response
            .json::<serde_json::Value>()
            .await
        {
            Ok(payload) => payload.get("result").is_some() && payload.get("error").is_none(),
            Err(_) => false,
        },
        _ => false,
    };

    let mut cache = cache.lock().await;
    cache.insert(
        url.to_string(),
        ProbeVerdict {
            healthy,
            checked_at: Instant::now(),
        },
    );
    healthy
}

async fn with_retry<T, F, Fut>(
    attempts: u32,
    delay: Duration,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!("{} attempt {}/{} failed: {}", label, attempt, attempts, e);
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| ResolveError::ExplorerQueryFailed(format!("{} failed", label))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_rpc_urls_rejects_templates() {
        let urls = vec![
            "https://rpc.example.org".to_string(),
            "https://mainnet.infura.io/v3/${INFURA_API_KEY}".to_string(),
            "https://eth.llamarpc.com".to_string(),
        ];
        let candidates = candidate_rpc_urls(&urls);
        assert_eq!(
            candidates,
            vec![
                "https://rpc.example.org".to_string(),
                "https://eth.llamarpc.com".to_string()
            ]
        );
    }

    #[test]
    fn test_chain_list_envelope_parses() {
        let payload = r#"{
            "comments": "",
            "totalcount": 2,
            "result": [
                {"chainname": "Ethereum Mainnet", "chainid": "1", "blockexplorer": "https://etherscan.io", "apiurl": "", "status": 1},
                {"chainname": "Sepolia", "chainid": "11155111", "blockexplorer": "https://sepolia.etherscan.io", "apiurl": "", "status": 1}
            ]
        }"#;
        let envelope: ChainListEnvelope = serde_json::from_str(payload).unwrap();
        let ids: Vec<u64> = envelope
            .result
            .iter()
            .filter_map(|entry| entry.chainid.parse().ok())
            .collect();
        assert_eq!(ids, vec![1, 11155111]);
    }

    #[test]
    fn test_chain_metadata_parses() {
        let payload = r#"{
            "result": {
                "data": {
                    "chain": {
                        "chainId": 1,
                        "name": "Ethereum Mainnet",
                        "rpc": ["https://eth.llamarpc.com", "https://mainnet.infura.io/v3/${INFURA_API_KEY}"],
                        "nativeCurrency": {"name": "Ether", "symbol": "ETH", "decimals": 18},
                        "explorers": [{"name": "etherscan", "url": "https://etherscan.io"}],
                        "icon": {"publicURL": "/static/abc/ethereum.png"}
                    }
                }
            }
        }"#;
        let envelope: PageDataEnvelope = serde_json::from_str(payload).unwrap();
        let chain = envelope.result.data.chain;
        assert_eq!(chain.chain_id, 1);
        assert_eq!(chain.native_currency.symbol, "ETH");
        assert_eq!(candidate_rpc_urls(&chain.rpc).len(), 1);
        assert!(chain.icon.unwrap().public_url.ends_with("ethereum.png"));
    }

    #[tokio::test]
    async fn test_get_on_empty_registry_requires_load() {
        // A registry with an unreachable feed fails load rather than
        // answering lookups from an empty table.
        let config = ChainlistConfig {
            etherscan_base: "http://127.0.0.1:1".to_string(),
            chainid_base: "http://127.0.0.1:1".to_string(),
            fetch_retries: 1,
            retry_delay_ms: 1,
            probe_timeout_ms: 10,
            probe_cache_secs: 60,
        };
        let registry = ChainRegistry::new(Client::new(), config);
        assert!(registry.get(1).await.is_err());
    }
}
