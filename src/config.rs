use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub explorer: ExplorerConfig,
    pub chainlist: ChainlistConfig,
    pub rpc: RpcConfig,
    pub signature_db: SignatureDbConfig,
    pub models: ModelConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorerConfig {
    /// Base URL of the Etherscan-V2-style multi-chain API.
    pub api_base: String,
    pub api_key: Option<String>,
    /// Extra attempts after the first failed source/creation lookup.
    pub retries: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainlistConfig {
    /// Where the canonical chain list lives (Etherscan V2 `/v2/chainlist`).
    pub etherscan_base: String,
    /// Per-chain metadata feed (chainid.network page-data).
    pub chainid_base: String,
    pub fetch_retries: u32,
    pub retry_delay_ms: u64,
    /// Timeout for the `eth_blockNumber` liveness probe per RPC URL.
    pub probe_timeout_ms: u64,
    /// How long a probe verdict stays valid before the URL is re-probed.
    pub probe_cache_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Per-endpoint timeout inside the fan-out race.
    pub attempt_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureDbConfig {
    /// OpenChain-style batched selector lookup endpoint.
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    /// Wall-clock ceiling for a whole extrapolation call, fallback included.
    pub budget_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Defaults to the platform cache directory when unset.
    pub dir: Option<std::path::PathBuf>,
    pub ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            explorer: ExplorerConfig {
                api_base: "https://api.etherscan.io".to_string(),
                api_key: None,
                retries: 2,
                retry_delay_ms: 500,
            },
            chainlist: ChainlistConfig {
                etherscan_base: "https://api.etherscan.io".to_string(),
                chainid_base: "https://chainid.network".to_string(),
                fetch_retries: 3,
                retry_delay_ms: 1000,
                probe_timeout_ms: 3000,
                probe_cache_secs: 3600,
            },
            rpc: RpcConfig {
                attempt_timeout_ms: 5000,
            },
            signature_db: SignatureDbConfig {
                endpoint: "https://api.openchain.xyz/signature-database/v1/lookup".to_string(),
            },
            models: ModelConfig {
                anthropic_api_key: None,
                openai_api_key: None,
                gemini_api_key: None,
                budget_secs: 20,
            },
            cache: CacheConfig {
                enabled: true,
                dir: None,
                ttl_secs: 3600,
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {:?}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {:?}: {}", path, e))?;

        Ok(config)
    }

    /// Load configuration with fallback to default
    pub async fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Self {
        let mut config = match path {
            Some(path) => match Self::load_from_file(path).await {
                Ok(config) => {
                    tracing::info!("Loaded configuration from file");
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to load config file, using defaults: {}", e);
                    Self::default()
                }
            },
            None => Self::default(),
        };

        config.apply_env_vars();
        config
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_vars(&mut self) {
        if let Ok(key) = std::env::var("ETHERSCAN_API_KEY") {
            tracing::debug!("Using ETHERSCAN_API_KEY for explorer queries");
            self.explorer.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.models.anthropic_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.models.openai_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            self.models.gemini_api_key = Some(key);
        }
    }

    /// Get default config file path
    pub fn default_config_path() -> Result<std::path::PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("abiscope").join("config.toml"))
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let sample_config = r#"# abiscope configuration file

[explorer]
api_base = "https://api.etherscan.io"
# api_key = "YOUR_ETHERSCAN_API_KEY"
retries = 2
retry_delay_ms = 500

[chainlist]
etherscan_base = "https://api.etherscan.io"
chainid_base = "https://chainid.network"
fetch_retries = 3
retry_delay_ms = 1000
probe_timeout_ms = 3000
probe_cache_secs = 3600

[rpc]
attempt_timeout_ms = 5000

[signature_db]
endpoint = "https://api.openchain.xyz/signature-database/v1/lookup"

[models]
# anthropic_api_key = "sk-ant-..."
# openai_api_key = "sk-..."
# gemini_api_key = "AI..."
budget_secs = 20

[cache]
enabled = true
ttl_secs = 3600

# Environment variables override file values:
# ETHERSCAN_API_KEY, ANTHROPIC_API_KEY, OPENAI_API_KEY, GEMINI_API_KEY
"#;
        sample_config.to_string()
    }
}
