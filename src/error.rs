use alloy::primitives::Address;
use thiserror::Error;

use crate::extrapolate::ProviderId;

/// Error taxonomy for the resolution pipeline.
///
/// Every failure a caller can observe has a distinct variant so the UI layer
/// can render a specific message instead of a generic one. Transport-level
/// wrappers (`Http`, `Json`) exist for plumbing; the orchestrator converts
/// them into a domain variant before they reach the caller wherever the
/// pipeline stage has a more specific meaning for them.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unsupported chain id {0}")]
    UnsupportedChain(u64),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("invalid chain id: {0}")]
    InvalidChainId(String),

    #[error("explorer query failed: {0}")]
    ExplorerQueryFailed(String),

    #[error("no code at address {0}; the address is likely an externally-owned account")]
    NoCodeAtAddress(Address),

    #[error("all rpc endpoints failed: {0}")]
    AllEndpointsFailed(String),

    #[error("no function selectors found in bytecode")]
    NoSelectorsFound,

    #[error("none of the extracted selectors resolved to a text signature")]
    NoSignaturesResolved,

    #[error("no usable model provider credentials were supplied")]
    NoValidCredentials,

    #[error("preferred provider {0} failed: {1}")]
    PreferredProviderFailed(ProviderId, String),

    #[error("all available model providers failed: {0}")]
    AllProvidersFailed(String),

    #[error("extrapolated ABI failed structural validation")]
    InvalidExtrapolatedAbi,

    #[error("model provider error: {0}")]
    Provider(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed response payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ResolveError>;
