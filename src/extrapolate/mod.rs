pub mod providers;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::error::{ResolveError, Result};
use crate::validate::normalize_signature_key;

pub use providers::{AnthropicProvider, GeminiProvider, OpenAiProvider};

/// The interchangeable model providers, in no particular order; fallback
/// order is [`PRIORITY_ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Anthropic,
    Openai,
    Gemini,
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderId::Anthropic => "anthropic",
            ProviderId::Openai => "openai",
            ProviderId::Gemini => "gemini",
        };
        f.write_str(name)
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" => Ok(ProviderId::Anthropic),
            "openai" => Ok(ProviderId::Openai),
            "gemini" => Ok(ProviderId::Gemini),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Most capable and most reliable first.
pub const PRIORITY_ORDER: [ProviderId; 3] =
    [ProviderId::Anthropic, ProviderId::Openai, ProviderId::Gemini];

/// Cheap shape check on a credential; each provider hands out keys with a
/// recognizable prefix. Not a cryptographic validation.
pub fn credential_looks_valid(provider: ProviderId, key: &str) -> bool {
    let prefix = match provider {
        ProviderId::Anthropic => "sk-ant-",
        ProviderId::Openai => "sk-",
        ProviderId::Gemini => "AI",
    };
    !key.is_empty() && key.starts_with(prefix)
}

pub(crate) const SYSTEM_PROMPT: &str = r#"You are a smart contract ABI fragments extrapolator.

Drawing on popular smart contract standards and conventions, extrapolate the full ABI fragment of each function from its name and input types.

Output a single JSON object with exactly two keys and nothing else:
1. "ABI": the array of extrapolated fragments, valid JSON ABI format.
2. "confidence": an object mapping each function signature (canonical form, no spaces, e.g. "approve(address,uint256)") to a number between 0 and 1 expressing how confident you are in its extrapolated fragment.

Example input: ["approve(address,uint256)","balanceOf(address)"]
Example output: {"ABI":[{"inputs":[{"internalType":"address","name":"spender","type":"address"},{"internalType":"uint256","name":"value","type":"uint256"}],"name":"approve","outputs":[{"internalType":"bool","name":"","type":"bool"}],"stateMutability":"nonpayable","type":"function"},{"inputs":[{"internalType":"address","name":"account","type":"address"}],"name":"balanceOf","outputs":[{"internalType":"uint256","name":"","type":"uint256"}],"stateMutability":"view","type":"function"}],"confidence":{"approve(address,uint256)":0.35,"balanceOf(address)":0.59}}"#;

/// A synthesized ABI plus per-fragment confidence scores.
#[derive(Debug, Clone)]
pub struct Extrapolation {
    pub abi: Value,
    pub confidence: BTreeMap<String, f64>,
}

/// One model provider's completion capability.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn extrapolate(&self, signatures: &[String]) -> Result<Extrapolation>;
}

/// Orchestrates the configured providers: a preferred provider is attempted
/// exclusively, otherwise providers are tried in priority order until one
/// succeeds. The whole call runs under a wall-clock budget.
pub struct ExtrapolationService {
    providers: Vec<Arc<dyn ModelProvider>>,
    budget: Duration,
}

impl ExtrapolationService {
    pub fn new(providers: Vec<Arc<dyn ModelProvider>>, budget: Duration) -> Self {
        Self { providers, budget }
    }

    /// Builds the provider set from whatever credentials look usable.
    pub fn from_credentials(client: Client, config: &ModelConfig) -> Result<Self> {
        let mut providers: Vec<Arc<dyn ModelProvider>> = Vec::new();

        if let Some(key) = &config.anthropic_api_key {
            if credential_looks_valid(ProviderId::Anthropic, key) {
                providers.push(Arc::new(AnthropicProvider::new(client.clone(), key.clone())));
            } else {
                warn!("Anthropic credential does not look valid, skipping provider");
            }
        }
        if let Some(key) = &config.openai_api_key {
            if credential_looks_valid(ProviderId::Openai, key) {
                providers.push(Arc::new(OpenAiProvider::new(client.clone(), key.clone())));
            } else {
                warn!("OpenAI credential does not look valid, skipping provider");
            }
        }
        if let Some(key) = &config.gemini_api_key {
            if credential_looks_valid(ProviderId::Gemini, key) {
                providers.push(Arc::new(GeminiProvider::new(client, key.clone())));
            } else {
                warn!("Gemini credential does not look valid, skipping provider");
            }
        }

        if providers.is_empty() {
            return Err(ResolveError::NoValidCredentials);
        }

        Ok(Self::new(providers, Duration::from_secs(config.budget_secs)))
    }

    pub fn available(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|p| p.id()).collect()
    }

    pub async fn extrapolate(
        &self,
        signatures: &[String],
        preferred: Option<ProviderId>,
    ) -> Result<Extrapolation> {
        if self.providers.is_empty() {
            return Err(ResolveError::NoValidCredentials);
        }

        match tokio::time::timeout(self.budget, self.run(signatures, preferred)).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::AllProvidersFailed(format!(
                "extrapolation budget of {}s exhausted",
                self.budget.as_secs()
            ))),
        }
    }

    async fn run(
        &self,
        signatures: &[String],
        preferred: Option<ProviderId>,
    ) -> Result<Extrapolation> {
        if let Some(preferred) = preferred {
            if let Some(provider) = self.providers.iter().find(|p| p.id() == preferred) {
                // The caller opted out of fallback by naming a provider.
                return provider.extrapolate(signatures).await.map_err(|e| {
                    ResolveError::PreferredProviderFailed(preferred, e.to_string())
                });
            }
            warn!(
                "Preferred provider {} has no usable credential, falling back to priority order",
                preferred
            );
        }

        let mut last_error = None;
        for id in PRIORITY_ORDER {
            let Some(provider) = self.providers.iter().find(|p| p.id() == id) else {
                continue;
            };
            debug!("Attempting extrapolation with {}", id);
            match provider.extrapolate(signatures).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!("Provider {} failed: {}", id, e);
                    last_error = Some(e);
                }
            }
        }

        Err(ResolveError::AllProvidersFailed(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no providers were attempted".to_string()),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct RawExtrapolation {
    #[serde(alias = "ABI")]
    abi: Value,
    #[serde(default)]
    confidence: BTreeMap<String, f64>,
}

/// Parses a provider's textual completion into a typed result.
///
/// Two input shapes are handled: bare JSON, and JSON wrapped in a markdown
/// code fence. Anything else is that provider attempt's failure, never a
/// fatal pipeline error.
pub(crate) fn parse_model_response(text: &str) -> Result<Extrapolation> {
    let body = strip_code_fences(text);

    let raw: RawExtrapolation = serde_json::from_str(&body)
        .map_err(|e| ResolveError::Provider(format!("returned non-JSON output: {}", e)))?;

    // Some models emit the ABI array as an embedded JSON string.
    let abi = match raw.abi {
        Value::String(inner) => serde_json::from_str(&inner)
            .map_err(|e| ResolveError::Provider(format!("embedded ABI string is not JSON: {}", e)))?,
        other => other,
    };

    let confidence = raw
        .confidence
        .into_iter()
        .map(|(key, score)| (normalize_signature_key(&key), score))
        .collect();

    Ok(Extrapolation { abi, confidence })
}

fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.trim_start_matches(['\r', '\n']);
        let rest = rest.strip_suffix("```").unwrap_or(rest);
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        id: ProviderId,
        fail: bool,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn ok(id: ProviderId) -> Arc<Self> {
            Arc::new(Self { id, fail: false, calls: AtomicUsize::new(0) })
        }

        fn failing(id: ProviderId) -> Arc<Self> {
            Arc::new(Self { id, fail: true, calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        fn id(&self) -> ProviderId {
            self.id
        }

        async fn extrapolate(&self, _signatures: &[String]) -> Result<Extrapolation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ResolveError::Provider(format!("{} is down", self.id)));
            }
            Ok(Extrapolation {
                abi: serde_json::json!([{"marker": self.id.to_string()}]),
                confidence: BTreeMap::new(),
            })
        }
    }

    fn service(providers: Vec<Arc<dyn ModelProvider>>) -> ExtrapolationService {
        ExtrapolationService::new(providers, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_fallback_skips_failed_provider() {
        let anthropic = ScriptedProvider::failing(ProviderId::Anthropic);
        let openai = ScriptedProvider::ok(ProviderId::Openai);
        let svc = service(vec![anthropic.clone(), openai.clone()]);

        let result = svc.extrapolate(&["transfer(address,uint256)".into()], None).await.unwrap();
        assert_eq!(result.abi[0]["marker"], "openai");
        assert_eq!(anthropic.calls(), 1);
        assert_eq!(openai.calls(), 1);
    }

    #[tokio::test]
    async fn test_priority_order_prefers_anthropic() {
        let anthropic = ScriptedProvider::ok(ProviderId::Anthropic);
        let gemini = ScriptedProvider::ok(ProviderId::Gemini);
        // Registration order deliberately reversed.
        let svc = service(vec![gemini.clone(), anthropic.clone()]);

        let result = svc.extrapolate(&[], None).await.unwrap();
        assert_eq!(result.abi[0]["marker"], "anthropic");
        assert_eq!(gemini.calls(), 0);
    }

    #[tokio::test]
    async fn test_preferred_provider_failure_does_not_fall_back() {
        let anthropic = ScriptedProvider::failing(ProviderId::Anthropic);
        let openai = ScriptedProvider::ok(ProviderId::Openai);
        let svc = service(vec![anthropic.clone(), openai.clone()]);

        let err = svc
            .extrapolate(&[], Some(ProviderId::Anthropic))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::PreferredProviderFailed(ProviderId::Anthropic, _)));
        assert_eq!(openai.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_providers_failing_wraps_last_error() {
        let svc = service(vec![
            ScriptedProvider::failing(ProviderId::Anthropic),
            ScriptedProvider::failing(ProviderId::Gemini),
        ]);

        let err = svc.extrapolate(&[], None).await.unwrap_err();
        match err {
            ResolveError::AllProvidersFailed(message) => {
                assert!(message.contains("gemini is down"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_budget_exhaustion_fails_fast() {
        struct SlowProvider;

        #[async_trait]
        impl ModelProvider for SlowProvider {
            fn id(&self) -> ProviderId {
                ProviderId::Anthropic
            }

            async fn extrapolate(&self, _signatures: &[String]) -> Result<Extrapolation> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!("budget should have expired first")
            }
        }

        let svc = ExtrapolationService::new(vec![Arc::new(SlowProvider)], Duration::from_millis(20));
        let err = svc.extrapolate(&[], None).await.unwrap_err();
        assert!(matches!(err, ResolveError::AllProvidersFailed(_)));
    }

    #[test]
    fn test_available_reflects_configured_providers() {
        let svc = service(vec![
            ScriptedProvider::ok(ProviderId::Openai),
            ScriptedProvider::ok(ProviderId::Gemini),
        ]);
        assert_eq!(svc.available(), vec![ProviderId::Openai, ProviderId::Gemini]);
    }

    #[test]
    fn test_parse_bare_json_response() {
        let text = r#"{"ABI": [{"name": "transfer"}], "confidence": {"transfer(address, uint256)": 0.8}}"#;
        let result = parse_model_response(text).unwrap();
        assert_eq!(result.abi[0]["name"], "transfer");
        assert_eq!(result.confidence["transfer(address,uint256)"], 0.8);
    }

    #[test]
    fn test_parse_fenced_json_response() {
        let text = "```json\n{\"ABI\": [], \"confidence\": {}}\n```";
        let result = parse_model_response(text).unwrap();
        assert!(result.abi.as_array().unwrap().is_empty());
    }

    #[test]
    fn test_parse_abi_embedded_as_string() {
        let text = r#"{"ABI": "[{\"name\": \"transfer\"}]", "confidence": {}}"#;
        let result = parse_model_response(text).unwrap();
        assert_eq!(result.abi[0]["name"], "transfer");
    }

    #[test]
    fn test_parse_garbage_is_provider_failure() {
        let err = parse_model_response("I am sorry, I cannot help with that.").unwrap_err();
        assert!(matches!(err, ResolveError::Provider(_)));
    }

    #[test]
    fn test_credential_prefixes() {
        assert!(credential_looks_valid(ProviderId::Anthropic, "sk-ant-abc123"));
        assert!(!credential_looks_valid(ProviderId::Anthropic, "sk-abc123"));
        assert!(credential_looks_valid(ProviderId::Openai, "sk-abc123"));
        assert!(credential_looks_valid(ProviderId::Gemini, "AIzaSyExample"));
        assert!(!credential_looks_valid(ProviderId::Gemini, ""));
    }

    #[test]
    fn test_provider_id_round_trips_from_str() {
        for id in PRIORITY_ORDER {
            assert_eq!(id.to_string().parse::<ProviderId>().unwrap(), id);
        }
        assert!("claude".parse::<ProviderId>().is_err());
    }
}
