use alloy::primitives::Address;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::debug;

use crate::chain::ChainRegistry;
use crate::config::RpcConfig;
use crate::error::{ResolveError, Result};

/// The JSON-RPC sentinel for "no bytecode deployed at this address".
pub const EMPTY_CODE: &str = "0x";

/// Races `attempt` against every endpoint concurrently and returns the value
/// of the first attempt that settles successfully.
///
/// Each attempt is allowed to fail on its own without cancelling its
/// siblings; once a winner settles, the losers are aborted best-effort. When
/// every attempt fails, the returned `AllEndpointsFailed` message concatenates
/// each endpoint's failure so none of the diagnostics are lost. No retry
/// happens at this layer.
pub async fn race_all<T, F, Fut>(endpoints: &[String], attempt: F) -> Result<T>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    if endpoints.is_empty() {
        return Err(ResolveError::AllEndpointsFailed(
            "no endpoints available".to_string(),
        ));
    }

    let mut set = JoinSet::new();
    for url in endpoints {
        let url = url.clone();
        let fut = attempt(url.clone());
        set.spawn(async move { (url, fut.await) });
    }

    let mut failures = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(value))) => {
                set.abort_all();
                return Ok(value);
            }
            Ok((url, Err(e))) => {
                debug!("Endpoint {} failed: {}", url, e);
                failures.push(format!("{}: {}", url, e));
            }
            Err(e) => failures.push(format!("endpoint task failed: {}", e)),
        }
    }

    Err(ResolveError::AllEndpointsFailed(failures.join("; ")))
}

/// Minimal view of a transaction, enough for deployment-info assembly.
#[derive(Debug, Clone)]
pub struct TransactionSummary {
    pub block_number: u64,
    pub from: Address,
}

/// Read access to chain state, raced across a chain's RPC endpoint set.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Returns the raw `eth_getCode` result, `"0x"` included; callers decide
    /// whether the empty-code sentinel is a domain error.
    async fn get_code(&self, chain_id: u64, address: Address) -> Result<String>;

    async fn get_transaction_by_hash(
        &self,
        chain_id: u64,
        tx_hash: &str,
    ) -> Result<TransactionSummary>;
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// [`NodeClient`] backed by the chain registry's endpoint sets: every call is
/// fanned out across all live endpoints of the chain and the first success
/// wins.
pub struct RacingNodeClient {
    registry: Arc<ChainRegistry>,
    client: Client,
    attempt_timeout: Duration,
}

impl RacingNodeClient {
    pub fn new(registry: Arc<ChainRegistry>, client: Client, config: &RpcConfig) -> Self {
        Self {
            registry,
            client,
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }

    async fn raced_call(&self, chain_id: u64, method: &str, params: Value) -> Result<Value> {
        let endpoints = self.registry.rpc_urls(chain_id).await?;
        let client = self.client.clone();
        let timeout = self.attempt_timeout;
        let method = method.to_string();

        race_all(&endpoints, move |url| {
            let client = client.clone();
            let method = method.clone();
            let params = params.clone();
            async move { single_call(&client, &url, &method, params, timeout).await }
        })
        .await
    }
}

async fn single_call(
    client: &Client,
    url: &str,
    method: &str,
    params: Value,
    timeout: Duration,
) -> Result<Value> {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });

    let response = client
        .post(url)
        .timeout(timeout)
        .json(&body)
        .send()
        .await?
        .error_for_status()?;

    let payload: JsonRpcResponse = response.json().await?;

    if let Some(error) = payload.error {
        return Err(ResolveError::Rpc(format!(
            "{} (code {})",
            error.message, error.code
        )));
    }

    payload
        .result
        .ok_or_else(|| ResolveError::Rpc("response had no result".to_string()))
}

#[async_trait]
impl NodeClient for RacingNodeClient {
    async fn get_code(&self, chain_id: u64, address: Address) -> Result<String> {
        let params = serde_json::json!([format!("{:?}", address), "latest"]);
        let result = self.raced_call(chain_id, "eth_getCode", params).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ResolveError::Rpc("eth_getCode returned non-string result".to_string()))
    }

    async fn get_transaction_by_hash(
        &self,
        chain_id: u64,
        tx_hash: &str,
    ) -> Result<TransactionSummary> {
        let params = serde_json::json!([tx_hash]);
        let result = self
            .raced_call(chain_id, "eth_getTransactionByHash", params)
            .await?;
        parse_transaction_summary(&result)
    }
}

fn parse_transaction_summary(result: &Value) -> Result<TransactionSummary> {
    if result.is_null() {
        return Err(ResolveError::Rpc("transaction not found".to_string()));
    }

    let block_number = result
        .get("blockNumber")
        .and_then(Value::as_str)
        .and_then(|hex| u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok())
        .ok_or_else(|| {
            ResolveError::Rpc("transaction has no block number".to_string())
        })?;

    let from = result
        .get("from")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Address>().ok())
        .ok_or_else(|| {
            ResolveError::Rpc("transaction has no sender".to_string())
        })?;

    Ok(TransactionSummary { block_number, from })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn endpoints(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://rpc-{}.example.org", i)).collect()
    }

    #[tokio::test]
    async fn test_race_returns_fastest_success() {
        let result = race_all(&endpoints(3), |url| async move {
            if url.contains("rpc-1") {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok("fast".to_string())
            } else if url.contains("rpc-2") {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok("slow".to_string())
            } else {
                Err(ResolveError::Rpc("boom".to_string()))
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "fast");
    }

    #[tokio::test]
    async fn test_race_aggregates_all_failures() {
        let err = race_all::<String, _, _>(&endpoints(3), |url| async move {
            Err(ResolveError::Rpc(format!("down ({})", url)))
        })
        .await
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("rpc-0"));
        assert!(message.contains("rpc-1"));
        assert!(message.contains("rpc-2"));
    }

    #[tokio::test]
    async fn test_race_with_no_endpoints_fails() {
        let err = race_all::<String, _, _>(&[], |_| async move { Ok("never".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::AllEndpointsFailed(_)));
    }

    #[tokio::test]
    async fn test_race_launches_all_attempts_concurrently() {
        static LAUNCHED: AtomicUsize = AtomicUsize::new(0);

        let _ = race_all(&endpoints(3), |_| async {
            LAUNCHED.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        })
        .await;

        // A sequential chain would have stopped after the first success.
        assert_eq!(LAUNCHED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_parse_transaction_summary() {
        let payload = serde_json::json!({
            "blockNumber": "0x12d687",
            "from": "0xd8da6bf26964af9d7eed9e03e53415d37aa96045",
            "hash": "0xabc"
        });
        let summary = parse_transaction_summary(&payload).unwrap();
        assert_eq!(summary.block_number, 0x12d687);
        assert_eq!(
            format!("{:?}", summary.from),
            "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045"
        );
    }

    #[test]
    fn test_parse_transaction_summary_null_is_error() {
        assert!(parse_transaction_summary(&Value::Null).is_err());
    }
}
