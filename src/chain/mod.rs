pub mod registry;

pub use registry::ChainRegistry;

use serde::{Deserialize, Serialize};

/// Native currency metadata for a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// A block-explorer link advertised by the chain metadata feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorerLink {
    pub name: String,
    pub url: String,
}

/// One supported chain's connectivity profile.
///
/// `rpc_urls` only contains endpoints that answered the liveness probe; a
/// chain that ends up with zero live endpoints is dropped from the registry
/// entirely, so a set held by a caller always has at least one URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEndpointSet {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub native_currency: NativeCurrency,
    pub explorers: Vec<ExplorerLink>,
    pub icon_url: Option<String>,
}
