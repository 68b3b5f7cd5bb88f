use alloy::json_abi::JsonAbi;
use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{record_cache_key, ResultCache};
use crate::error::{ResolveError, Result};
use crate::explorer::{SourceMetadata, SourceResolver};
use crate::extrapolate::{ExtrapolationService, ProviderId};
use crate::rpc::{NodeClient, EMPTY_CODE};
use crate::selectors::extract_selectors;
use crate::signatures::SignatureDatabase;
use crate::validate::{fragment_signature, validate_extrapolated_abi};

/// The finished product of a resolution: everything the pipeline could learn
/// about one contract on one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractInterfaceRecord {
    pub chain_id: u64,
    /// EIP-55 checksummed form of the queried address.
    pub address: String,
    pub is_verified: bool,
    pub contract_name: Option<String>,
    pub source_code: Option<String>,
    /// Runtime bytecode, fetched only when the extrapolation path ran.
    pub bytecode: Option<String>,
    pub abi: Value,
    /// Per-fragment confidence, present only for extrapolated ABIs.
    pub confidence_scores: Option<BTreeMap<String, f64>>,
    pub deployment_block: Option<u64>,
    pub deployer: Option<String>,
    pub compiler_version: Option<String>,
    pub optimization_used: Option<bool>,
    pub runs: Option<u64>,
    pub is_proxy: bool,
    pub implementation_address: Option<String>,
}

/// One source file carved out of the explorer's source blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedSource {
    pub name: String,
    pub content: String,
}

impl ContractInterfaceRecord {
    /// Splits the explorer's source blob into individual files.
    ///
    /// Etherscan returns multi-file submissions as standard-JSON wrapped in
    /// an extra brace pair (`{{ ... }}`), single-file submissions as the raw
    /// Solidity text. Both shapes are handled; anything unrecognizable is
    /// returned as one file.
    pub fn source_files(&self) -> Vec<FormattedSource> {
        let Some(source) = &self.source_code else {
            return Vec::new();
        };
        let trimmed = source.trim();

        let json_body = if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
            Some(&trimmed[1..trimmed.len() - 1])
        } else if trimmed.starts_with('{') {
            Some(trimmed)
        } else {
            None
        };

        if let Some(body) = json_body {
            if let Ok(value) = serde_json::from_str::<Value>(body) {
                let sources = value.get("sources").unwrap_or(&value);
                if let Some(map) = sources.as_object() {
                    let mut files: Vec<FormattedSource> = map
                        .iter()
                        .filter_map(|(path, entry)| {
                            entry.get("content").and_then(Value::as_str).map(|content| {
                                FormattedSource {
                                    name: path.clone(),
                                    content: content.to_string(),
                                }
                            })
                        })
                        .collect();
                    if !files.is_empty() {
                        files.sort_by(|a, b| a.name.cmp(&b.name));
                        return files;
                    }
                }
            }
        }

        let name = self
            .contract_name
            .as_deref()
            .map(|name| format!("{}.sol", name))
            .unwrap_or_else(|| "Contract.sol".to_string());
        vec![FormattedSource {
            name,
            content: source.clone(),
        }]
    }
}

/// End-to-end contract interface acquisition: explorer lookup first, and on
/// unverified contracts the bytecode/signature/model extrapolation fallback.
pub struct ContractInterfaceResolver {
    source: SourceResolver,
    node: Arc<dyn NodeClient>,
    signatures: Arc<dyn SignatureDatabase>,
    models: ExtrapolationService,
    cache: Option<Arc<dyn ResultCache>>,
    cache_ttl: Duration,
}

impl ContractInterfaceResolver {
    pub fn new(
        source: SourceResolver,
        node: Arc<dyn NodeClient>,
        signatures: Arc<dyn SignatureDatabase>,
        models: ExtrapolationService,
        cache: Option<Arc<dyn ResultCache>>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            source,
            node,
            signatures,
            models,
            cache,
            cache_ttl,
        }
    }

    /// Resolves the interface of `address` on `chain_id`.
    ///
    /// Input validation happens before any I/O. Verified contracts return the
    /// explorer's ABI directly; unverified contracts go through selector
    /// extraction, public signature lookup and model extrapolation, and the
    /// extrapolated result is cached. Dropping the returned future cancels
    /// all in-flight work.
    pub async fn resolve(
        &self,
        chain_id: u64,
        address: &str,
        preferred: Option<ProviderId>,
    ) -> Result<ContractInterfaceRecord> {
        if chain_id == 0 {
            return Err(ResolveError::InvalidChainId(chain_id.to_string()));
        }
        let address = Address::from_str(address.trim())
            .map_err(|_| ResolveError::InvalidAddress(address.to_string()))?;

        if let Some(cache) = &self.cache {
            let key = record_cache_key(chain_id, &address, None);
            if let Some(record) = cache.get(&key).await {
                info!("Returning cached interface for {:?} on chain {}", address, chain_id);
                return Ok(record);
            }
        }

        let metadata = self.source.resolve(chain_id, address).await?;

        let record = if metadata.is_verified {
            self.verified_record(metadata).await?
        } else {
            self.extrapolated_record(metadata, preferred).await?
        };

        Ok(record)
    }

    /// The verified path: the explorer already has the canonical ABI.
    async fn verified_record(&self, metadata: SourceMetadata) -> Result<ContractInterfaceRecord> {
        let raw_abi = metadata
            .abi
            .as_deref()
            .ok_or(ResolveError::ExplorerQueryFailed(
                "verified contract carried no ABI".to_string(),
            ))?;
        let abi: Value = serde_json::from_str(raw_abi)?;

        if serde_json::from_str::<JsonAbi>(raw_abi).is_err() {
            warn!(
                "Explorer ABI for {:?} does not parse as a typed ABI, returning it as-is",
                metadata.address
            );
        }

        let deployment = self.deployment_info(metadata.chain_id, metadata.address).await;

        Ok(assemble(metadata, abi, None, None, deployment))
    }

    /// The fallback path: derive selectors from bytecode, resolve them against
    /// the public signature database, and have a model fill in the rest.
    async fn extrapolated_record(
        &self,
        metadata: SourceMetadata,
        preferred: Option<ProviderId>,
    ) -> Result<ContractInterfaceRecord> {
        let chain_id = metadata.chain_id;
        let address = metadata.address;
        // The implementation's bytecode is what actually dispatches.
        let code_address = metadata.implementation_address.unwrap_or(address);

        let bytecode = self.node.get_code(chain_id, code_address).await?;
        if bytecode == EMPTY_CODE {
            return Err(ResolveError::NoCodeAtAddress(code_address));
        }

        if let Some(cache) = &self.cache {
            let key = record_cache_key(chain_id, &address, Some(&bytecode));
            if let Some(record) = cache.get(&key).await {
                info!("Returning cached extrapolation for bytecode at {:?}", address);
                return Ok(record);
            }
        }

        let selectors = extract_selectors(&bytecode)?;
        if selectors.is_empty() {
            return Err(ResolveError::NoSelectorsFound);
        }
        debug!("Extracted {} selectors from {:?}", selectors.len(), code_address);

        let candidates = self.signatures.lookup(&selectors).await?;
        let signatures: Vec<String> = candidates
            .iter()
            .filter_map(|candidate| candidate.text_signature.clone())
            .collect();
        if signatures.is_empty() {
            return Err(ResolveError::NoSignaturesResolved);
        }
        info!(
            "Resolved {}/{} selectors, extrapolating full fragments",
            signatures.len(),
            selectors.len()
        );

        let extrapolation = self.models.extrapolate(&signatures, preferred).await?;

        if !validate_extrapolated_abi(&extrapolation.abi, &extrapolation.confidence) {
            return Err(ResolveError::InvalidExtrapolatedAbi);
        }
        if !confidence_covers_abi(&extrapolation.abi, &extrapolation.confidence) {
            return Err(ResolveError::InvalidExtrapolatedAbi);
        }

        let deployment = self.deployment_info(chain_id, address).await;
        let record = assemble(
            metadata,
            extrapolation.abi,
            Some(extrapolation.confidence),
            Some(bytecode.clone()),
            deployment,
        );

        if let Some(cache) = &self.cache {
            let bytecode_key = record_cache_key(chain_id, &address, Some(&bytecode));
            cache.set(&bytecode_key, &record, self.cache_ttl).await;
            let address_key = record_cache_key(chain_id, &address, None);
            cache.set(&address_key, &record, self.cache_ttl).await;
        }

        Ok(record)
    }

    /// Deployment block and deployer, assembled from the explorer's creation
    /// transaction lookup plus a node query. Failures here degrade the record
    /// instead of failing the resolution.
    async fn deployment_info(&self, chain_id: u64, address: Address) -> Option<(u64, Address)> {
        let tx_hash = match self.source.creation_tx(chain_id, address).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Could not look up creation tx for {:?}: {}", address, e);
                return None;
            }
        };
        match self.node.get_transaction_by_hash(chain_id, &tx_hash).await {
            Ok(summary) => Some((summary.block_number, summary.from)),
            Err(e) => {
                warn!("Could not fetch creation tx {}: {}", tx_hash, e);
                None
            }
        }
    }
}

/// Every named fragment must have a confidence score under its canonical
/// signature key.
fn confidence_covers_abi(abi: &Value, confidence: &BTreeMap<String, f64>) -> bool {
    let Some(items) = abi.as_array() else {
        return false;
    };
    items
        .iter()
        .filter_map(fragment_signature)
        .all(|signature| confidence.contains_key(&signature))
}

fn assemble(
    metadata: SourceMetadata,
    abi: Value,
    confidence_scores: Option<BTreeMap<String, f64>>,
    bytecode: Option<String>,
    deployment: Option<(u64, Address)>,
) -> ContractInterfaceRecord {
    ContractInterfaceRecord {
        chain_id: metadata.chain_id,
        address: metadata.address.to_checksum(None),
        is_verified: metadata.is_verified,
        contract_name: metadata.contract_name,
        source_code: metadata.source_code,
        bytecode,
        abi,
        confidence_scores,
        deployment_block: deployment.map(|(block, _)| block),
        deployer: deployment.map(|(_, from)| from.to_checksum(None)),
        compiler_version: metadata.compiler_version,
        optimization_used: metadata.optimization_used,
        runs: metadata.runs,
        is_proxy: metadata.is_proxy,
        implementation_address: metadata.implementation_address.map(|a| a.to_checksum(None)),
    }
}
