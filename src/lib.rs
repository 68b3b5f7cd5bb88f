//! Contract interface acquisition for EVM chains.
//!
//! Given a chain id and an address, the pipeline first asks the block
//! explorer for verified source metadata (following proxies to their
//! implementation). When the contract is unverified it falls back to
//! reconstructing the interface: fetch the runtime bytecode, extract the
//! 4-byte dispatch selectors, resolve them against a public signature
//! database, and have a language model extrapolate the full ABI fragments
//! with per-fragment confidence scores.

pub mod cache;
pub mod chain;
pub mod config;
pub mod error;
pub mod explorer;
pub mod extrapolate;
pub mod resolver;
pub mod rpc;
pub mod selectors;
pub mod signatures;
pub mod validate;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use config::Config;
pub use error::{ResolveError, Result};
pub use extrapolate::ProviderId;
pub use resolver::{ContractInterfaceRecord, ContractInterfaceResolver};

use cache::{DiskCache, ResultCache};
use chain::ChainRegistry;
use explorer::{EtherscanClient, SourceResolver};
use extrapolate::ExtrapolationService;
use rpc::RacingNodeClient;
use signatures::OpenChainClient;

/// Wires the production clients together from a configuration.
///
/// Missing model credentials are not an error at construction time; the
/// extrapolation fallback just becomes unavailable.
pub fn build_resolver(config: &Config) -> Result<ContractInterfaceResolver> {
    let client = reqwest::Client::new();

    let registry = Arc::new(ChainRegistry::new(client.clone(), config.chainlist.clone()));
    let node = Arc::new(RacingNodeClient::new(registry, client.clone(), &config.rpc));

    let explorer = Arc::new(EtherscanClient::new(client.clone(), &config.explorer));
    let source = SourceResolver::new(explorer, &config.explorer);

    let signatures = Arc::new(OpenChainClient::new(client.clone(), &config.signature_db));

    let models = match ExtrapolationService::from_credentials(client, &config.models) {
        Ok(service) => {
            let available: Vec<String> =
                service.available().iter().map(ToString::to_string).collect();
            info!("Model providers available: {}", available.join(", "));
            service
        }
        Err(ResolveError::NoValidCredentials) => {
            warn!("No usable model credentials configured; unverified contracts cannot be extrapolated");
            ExtrapolationService::new(Vec::new(), Duration::from_secs(config.models.budget_secs))
        }
        Err(e) => return Err(e),
    };

    let cache: Option<Arc<dyn ResultCache>> = if config.cache.enabled {
        Some(Arc::new(DiskCache::new(&config.cache)))
    } else {
        None
    };

    Ok(ContractInterfaceResolver::new(
        source,
        node,
        signatures,
        models,
        cache,
        Duration::from_secs(config.cache.ttl_secs),
    ))
}

/// One-shot resolution with explicitly supplied model credentials, for
/// callers that don't want to manage a [`Config`] or a long-lived resolver.
pub async fn resolve_contract_interface(
    chain_id: u64,
    address: &str,
    credentials: HashMap<ProviderId, String>,
    preferred: Option<ProviderId>,
) -> Result<ContractInterfaceRecord> {
    let mut config = Config::default();
    for (provider, key) in credentials {
        match provider {
            ProviderId::Anthropic => config.models.anthropic_api_key = Some(key),
            ProviderId::Openai => config.models.openai_api_key = Some(key),
            ProviderId::Gemini => config.models.gemini_api_key = Some(key),
        }
    }

    let resolver = build_resolver(&config)?;
    resolver.resolve(chain_id, address, preferred).await
}
