use crate::types::UserOperationRequest;
use ethers::types::{Address, H256};
use serde_json::Value;

/// Errors surfaced by the user operation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AaError {
    /// The builder struct is missing fields (or carries a mixed/invalid set) and cannot be signed.
    ///
    /// `partial` is a JSON-safe snapshot of the struct, with big integers as
    /// `{ "type": "bigint", "value": "<decimal>" }`.
    #[error("invalid user operation: missing or invalid fields {missing:?}: {partial}")]
    InvalidUserOperation {
        missing: Vec<&'static str>,
        partial: Value,
    },

    /// No account was connected to the client and none was passed to the call.
    #[error("could not find an account to execute with")]
    AccountNotFound,

    /// The client cannot serve the requested action (wrong chain, unsupported EntryPoint, ...).
    #[error("incompatible client for {action}: {reason}")]
    IncompatibleClient { action: &'static str, reason: String },

    /// The confirmation tracker exhausted its retries without a receipt.
    ///
    /// `request` is the exact signed request that was submitted so it can be dropped and replaced.
    #[error("failed to find transaction for user operation {hash:?} after retries")]
    WaitForUserOperation {
        hash: H256,
        request: Box<UserOperationRequest>,
    },

    /// JSON-RPC error object returned by a bundler or paymaster, surfaced verbatim.
    #[error("{method} rejected: code={code} message={message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("no EntryPoint {version} known for chain {chain_id}")]
    UnsupportedEntryPoint { version: String, chain_id: u64 },

    #[error("EntryPoint {address:?} does not match version {version}")]
    EntryPointMismatch { address: Address, version: String },

    #[error("invalid multiplier {0}: must be finite, positive and have at most 4 decimals")]
    InvalidMultiplier(f64),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl AaError {
    /// Drop-and-replace needs the original request; only the wait error carries it.
    pub fn dropped_request(&self) -> Option<&UserOperationRequest> {
        match self {
            AaError::WaitForUserOperation { request, .. } => Some(request),
            _ => None,
        }
    }
}

pub type Result<T, E = AaError> = std::result::Result<T, E>;
