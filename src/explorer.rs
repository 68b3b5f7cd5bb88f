use alloy::primitives::Address;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ExplorerConfig;
use crate::error::{ResolveError, Result};

/// The literal the explorer puts in the ABI field of unverified contracts.
pub const NOT_VERIFIED_SENTINEL: &str = "Contract source code not verified";

/// Hard bound on proxy-chain following, guarding against malformed cyclic
/// proxy data in the explorer's records.
pub const MAX_PROXY_HOPS: usize = 5;

/// One entry of the explorer's `getsourcecode` result array.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct SourceCodeEntry {
    pub source_code: String,
    #[serde(rename = "ABI")]
    pub abi: String,
    pub contract_name: String,
    pub compiler_version: String,
    pub optimization_used: String,
    pub runs: String,
    pub proxy: String,
    pub implementation: String,
}

/// Block-explorer API access, narrowed to the two lookups the pipeline needs.
#[async_trait]
pub trait ExplorerApi: Send + Sync {
    async fn get_source_code(&self, chain_id: u64, address: Address) -> Result<SourceCodeEntry>;

    /// Returns the hash of the transaction that deployed the contract.
    async fn get_contract_creation(&self, chain_id: u64, address: Address) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ExplorerEnvelope {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreationEntry {
    tx_hash: String,
}

/// Etherscan-V2-style multi-chain client.
pub struct EtherscanClient {
    client: Client,
    api_base: String,
    api_key: Option<String>,
}

impl EtherscanClient {
    pub fn new(client: Client, config: &ExplorerConfig) -> Self {
        Self {
            client,
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn build_url(&self, chain_id: u64, action: &str, address_param: &str, address: Address) -> String {
        let mut url = format!(
            "{}/v2/api?chainid={}&module=contract&action={}&{}={:?}",
            self.api_base, chain_id, action, address_param, address
        );
        if let Some(api_key) = &self.api_key {
            url.push_str(&format!("&apikey={}", api_key));
        }
        url
    }

    async fn fetch_envelope(&self, url: &str) -> Result<ExplorerEnvelope> {
        let envelope: ExplorerEnvelope = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // The envelope's own status is distinct from HTTP status: "0" means
        // a logical failure such as a rate limit or an unknown address.
        if envelope.status == "0" {
            let detail = envelope
                .result
                .as_str()
                .map(str::to_string)
                .unwrap_or_default();
            return Err(ResolveError::ExplorerQueryFailed(format!(
                "{} {}",
                envelope.message, detail
            )));
        }

        Ok(envelope)
    }
}

#[async_trait]
impl ExplorerApi for EtherscanClient {
    async fn get_source_code(&self, chain_id: u64, address: Address) -> Result<SourceCodeEntry> {
        let url = self.build_url(chain_id, "getsourcecode", "address", address);
        let envelope = self.fetch_envelope(&url).await?;

        let entries: Vec<SourceCodeEntry> = serde_json::from_value(envelope.result)?;
        entries.into_iter().next().ok_or_else(|| {
            ResolveError::ExplorerQueryFailed("empty getsourcecode result".to_string())
        })
    }

    async fn get_contract_creation(&self, chain_id: u64, address: Address) -> Result<String> {
        let url = self.build_url(chain_id, "getcontractcreation", "contractaddresses", address);
        let envelope = self.fetch_envelope(&url).await?;

        let entries: Vec<CreationEntry> = serde_json::from_value(envelope.result)?;
        entries
            .into_iter()
            .next()
            .map(|entry| entry.tx_hash)
            .ok_or_else(|| {
                ResolveError::ExplorerQueryFailed("empty getcontractcreation result".to_string())
            })
    }
}

/// Verification status and source metadata for one contract, already
/// proxy-resolved: `address` is the originally queried address even when the
/// metadata was fetched from the implementation behind a proxy.
#[derive(Debug, Clone)]
pub struct SourceMetadata {
    pub chain_id: u64,
    pub address: Address,
    pub is_verified: bool,
    pub contract_name: Option<String>,
    pub source_code: Option<String>,
    /// Raw ABI JSON string, present only when the source is verified.
    pub abi: Option<String>,
    pub compiler_version: Option<String>,
    pub optimization_used: Option<bool>,
    pub runs: Option<u64>,
    pub is_proxy: bool,
    pub implementation_address: Option<Address>,
}

/// Resolves a contract's verification status and source metadata, following
/// proxy-to-implementation redirection with bounded retries on each lookup.
pub struct SourceResolver {
    api: Arc<dyn ExplorerApi>,
    retries: u32,
    retry_delay: Duration,
}

impl SourceResolver {
    pub fn new(api: Arc<dyn ExplorerApi>, config: &ExplorerConfig) -> Self {
        Self {
            api,
            retries: config.retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Follows the proxy chain depth-first and returns the terminal
    /// implementation's metadata, reported under the queried address.
    ///
    /// A self-referential proxy record (implementation equal to the address
    /// that claims to be a proxy) terminates immediately; genuine chains are
    /// capped at [`MAX_PROXY_HOPS`].
    pub async fn resolve(&self, chain_id: u64, address: Address) -> Result<SourceMetadata> {
        let mut current = address;
        let mut hops = 0usize;

        loop {
            let entry = self
                .fetch_with_retry(|| self.api.get_source_code(chain_id, current))
                .await?;

            let implementation = parse_optional_address(&entry.implementation);
            let claims_proxy = entry.proxy == "1";

            let terminal = match implementation {
                Some(implementation) if claims_proxy => implementation == current,
                _ => true,
            };

            if terminal {
                return Ok(build_metadata(chain_id, address, current, hops, entry));
            }

            hops += 1;
            if hops > MAX_PROXY_HOPS {
                return Err(ResolveError::ExplorerQueryFailed(format!(
                    "proxy chain for {:?} exceeded {} hops",
                    address, MAX_PROXY_HOPS
                )));
            }

            let next = implementation.unwrap_or(current);
            debug!(
                "Following proxy hop {}: {:?} -> {:?}",
                hops, current, next
            );
            current = next;
        }
    }

    /// Looks up the hash of the contract's creation transaction.
    pub async fn creation_tx(&self, chain_id: u64, address: Address) -> Result<String> {
        self.fetch_with_retry(|| self.api.get_contract_creation(chain_id, address))
            .await
    }

    /// Network, parse and logical failures all share the same bounded retry.
    async fn fetch_with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.retries + 1;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!("Explorer lookup attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ResolveError::ExplorerQueryFailed("explorer lookup failed".to_string())
        }))
    }
}

fn build_metadata(
    chain_id: u64,
    queried: Address,
    current: Address,
    hops: usize,
    entry: SourceCodeEntry,
) -> SourceMetadata {
    let is_verified = !entry.abi.is_empty() && entry.abi != NOT_VERIFIED_SENTINEL;
    let followed_proxy = hops > 0;

    SourceMetadata {
        chain_id,
        address: queried,
        is_verified,
        contract_name: non_empty(entry.contract_name),
        source_code: non_empty(entry.source_code),
        abi: is_verified.then_some(entry.abi),
        compiler_version: non_empty(entry.compiler_version),
        optimization_used: match entry.optimization_used.as_str() {
            "1" => Some(true),
            "0" => Some(false),
            _ => None,
        },
        runs: entry.runs.parse().ok(),
        is_proxy: followed_proxy,
        implementation_address: followed_proxy.then_some(current),
    }
}

fn parse_optional_address(raw: &str) -> Option<Address> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Address::from_str(raw).ok()
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Mock explorer with a fixed address -> entry table and a call counter.
    struct FakeExplorer {
        entries: HashMap<Address, SourceCodeEntry>,
        calls: Mutex<Vec<Address>>,
        failures_before_success: Mutex<u32>,
    }

    impl FakeExplorer {
        fn new(entries: HashMap<Address, SourceCodeEntry>) -> Self {
            Self {
                entries,
                calls: Mutex::new(Vec::new()),
                failures_before_success: Mutex::new(0),
            }
        }

        fn flaky(entries: HashMap<Address, SourceCodeEntry>, failures: u32) -> Self {
            let explorer = Self::new(entries);
            *explorer.failures_before_success.lock().unwrap() = failures;
            explorer
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ExplorerApi for FakeExplorer {
        async fn get_source_code(
            &self,
            _chain_id: u64,
            address: Address,
        ) -> Result<SourceCodeEntry> {
            self.calls.lock().unwrap().push(address);
            {
                let mut failures = self.failures_before_success.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(ResolveError::ExplorerQueryFailed("rate limited".into()));
                }
            }
            self.entries
                .get(&address)
                .cloned()
                .ok_or_else(|| ResolveError::ExplorerQueryFailed("unknown address".into()))
        }

        async fn get_contract_creation(
            &self,
            _chain_id: u64,
            _address: Address,
        ) -> Result<String> {
            Ok("0xdeadbeef".to_string())
        }
    }

    fn addr(n: u8) -> Address {
        Address::from([n; 20])
    }

    fn verified_entry(name: &str) -> SourceCodeEntry {
        SourceCodeEntry {
            source_code: "contract A {}".to_string(),
            abi: "[]".to_string(),
            contract_name: name.to_string(),
            compiler_version: "v0.8.24".to_string(),
            optimization_used: "1".to_string(),
            runs: "200".to_string(),
            proxy: "0".to_string(),
            implementation: String::new(),
        }
    }

    fn proxy_entry(implementation: Address) -> SourceCodeEntry {
        SourceCodeEntry {
            proxy: "1".to_string(),
            implementation: format!("{:?}", implementation),
            abi: "[]".to_string(),
            ..Default::default()
        }
    }

    fn resolver(api: Arc<dyn ExplorerApi>) -> SourceResolver {
        let config = crate::config::ExplorerConfig {
            api_base: String::new(),
            api_key: None,
            retries: 2,
            retry_delay_ms: 1,
        };
        SourceResolver::new(api, &config)
    }

    #[tokio::test]
    async fn test_direct_lookup_not_a_proxy() {
        let mut entries = HashMap::new();
        entries.insert(addr(1), verified_entry("Token"));
        let resolver = resolver(Arc::new(FakeExplorer::new(entries)));

        let meta = resolver.resolve(1, addr(1)).await.unwrap();
        assert_eq!(meta.address, addr(1));
        assert!(meta.is_verified);
        assert!(!meta.is_proxy);
        assert!(meta.implementation_address.is_none());
        assert_eq!(meta.contract_name.as_deref(), Some("Token"));
        assert_eq!(meta.optimization_used, Some(true));
        assert_eq!(meta.runs, Some(200));
    }

    #[tokio::test]
    async fn test_proxy_chain_reports_queried_address() {
        // 1 -> 2 -> 3 (terminal, verified)
        let mut entries = HashMap::new();
        entries.insert(addr(1), proxy_entry(addr(2)));
        entries.insert(addr(2), proxy_entry(addr(3)));
        entries.insert(addr(3), verified_entry("Impl"));
        let resolver = resolver(Arc::new(FakeExplorer::new(entries)));

        let meta = resolver.resolve(1, addr(1)).await.unwrap();
        assert_eq!(meta.address, addr(1));
        assert!(meta.is_proxy);
        assert_eq!(meta.implementation_address, Some(addr(3)));
        assert_eq!(meta.contract_name.as_deref(), Some("Impl"));
        assert!(meta.is_verified);
    }

    #[tokio::test]
    async fn test_degenerate_self_proxy_terminates_in_one_step() {
        let mut entries = HashMap::new();
        let mut entry = proxy_entry(addr(1));
        entry.contract_name = "Weird".to_string();
        entries.insert(addr(1), entry);
        let explorer = Arc::new(FakeExplorer::new(entries));
        let resolver = resolver(explorer.clone());

        let meta = resolver.resolve(1, addr(1)).await.unwrap();
        assert_eq!(meta.address, addr(1));
        assert!(!meta.is_proxy);
        assert_eq!(explorer.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cyclic_proxy_chain_is_capped() {
        // 1 -> 2 -> 1 -> 2 -> ... never terminates on its own.
        let mut entries = HashMap::new();
        entries.insert(addr(1), proxy_entry(addr(2)));
        entries.insert(addr(2), proxy_entry(addr(1)));
        let resolver = resolver(Arc::new(FakeExplorer::new(entries)));

        let err = resolver.resolve(1, addr(1)).await.unwrap_err();
        assert!(err.to_string().contains("exceeded"));
    }

    #[tokio::test]
    async fn test_unverified_contract_is_confirmed_not_errored() {
        let mut entries = HashMap::new();
        let mut entry = SourceCodeEntry::default();
        entry.abi = NOT_VERIFIED_SENTINEL.to_string();
        entries.insert(addr(1), entry);
        let resolver = resolver(Arc::new(FakeExplorer::new(entries)));

        let meta = resolver.resolve(1, addr(1)).await.unwrap();
        assert!(!meta.is_verified);
        assert!(meta.abi.is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mut entries = HashMap::new();
        entries.insert(addr(1), verified_entry("Token"));
        let explorer = Arc::new(FakeExplorer::flaky(entries, 2));
        let resolver = resolver(explorer.clone());

        let meta = resolver.resolve(1, addr(1)).await.unwrap();
        assert!(meta.is_verified);
        assert_eq!(explorer.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_explorer_error() {
        let explorer = Arc::new(FakeExplorer::flaky(HashMap::new(), 10));
        let resolver = resolver(explorer);

        let err = resolver.resolve(1, addr(1)).await.unwrap_err();
        assert!(matches!(err, ResolveError::ExplorerQueryFailed(_)));
    }

    #[test]
    fn test_source_code_entry_parses_etherscan_shape() {
        let payload = r#"{
            "SourceCode": "contract A {}",
            "ABI": "[]",
            "ContractName": "A",
            "CompilerVersion": "v0.8.24+commit.e11b9ed9",
            "OptimizationUsed": "1",
            "Runs": "200",
            "ConstructorArguments": "",
            "Proxy": "0",
            "Implementation": ""
        }"#;
        let entry: SourceCodeEntry = serde_json::from_str(payload).unwrap();
        assert_eq!(entry.contract_name, "A");
        assert_eq!(entry.proxy, "0");
    }
}
