use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;

use crate::config::SignatureDbConfig;
use crate::error::{ResolveError, Result};
use crate::selectors::Selector;

/// A selector paired with its best candidate text signature, if the database
/// knew one.
#[derive(Debug, Clone)]
pub struct SignatureCandidate {
    pub selector: Selector,
    pub text_signature: Option<String>,
}

/// Batched selector-to-text-signature resolution.
#[async_trait]
pub trait SignatureDatabase: Send + Sync {
    /// Resolves all selectors in one query; unmatched selectors come back
    /// with `text_signature: None`, in input order.
    async fn lookup(&self, selectors: &[Selector]) -> Result<Vec<SignatureCandidate>>;
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    ok: bool,
    #[serde(default)]
    result: LookupResult,
}

#[derive(Debug, Deserialize, Default)]
struct LookupResult {
    #[serde(default)]
    function: HashMap<String, Option<Vec<SignatureEntry>>>,
}

#[derive(Debug, Deserialize)]
struct SignatureEntry {
    name: String,
}

/// OpenChain-style public signature database client.
pub struct OpenChainClient {
    client: Client,
    endpoint: String,
}

impl OpenChainClient {
    pub fn new(client: Client, config: &SignatureDbConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.clone(),
        }
    }
}

#[async_trait]
impl SignatureDatabase for OpenChainClient {
    async fn lookup(&self, selectors: &[Selector]) -> Result<Vec<SignatureCandidate>> {
        if selectors.is_empty() {
            return Ok(Vec::new());
        }

        let joined = selectors
            .iter()
            .map(Selector::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let response: LookupResponse = self
            .client
            .get(&self.endpoint)
            .query(&[("function", joined.as_str()), ("filter", "true")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.ok {
            return Err(ResolveError::ExplorerQueryFailed(
                "signature database reported a failed lookup".to_string(),
            ));
        }

        Ok(map_candidates(selectors, &response.result.function))
    }
}

fn map_candidates(
    selectors: &[Selector],
    matches: &HashMap<String, Option<Vec<SignatureEntry>>>,
) -> Vec<SignatureCandidate> {
    selectors
        .iter()
        .map(|selector| {
            let text_signature = matches
                .get(&selector.to_string())
                .and_then(|entries| entries.as_ref())
                .and_then(|entries| entries.first())
                .map(|entry| entry.name.clone());
            SignatureCandidate {
                selector: *selector,
                text_signature,
            }
        })
        .collect()
}
