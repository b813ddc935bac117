use crate::model::RequestId;
use alloy_primitives::B256;
use std::time::Duration;

/// Errors raised while talking to a JSON-RPC endpoint.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The HTTP request could not be sent or the body could not be read.
    #[error("transport failure calling {method}: {source}")]
    Transport {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    /// The node answered with a JSON-RPC error object.
    #[error("{method} returned error {code}: {message}")]
    Node {
        method: String,
        code: i64,
        message: String,
    },

    /// The response did not have the expected shape.
    #[error("failed to decode {method} response: {reason}")]
    Decode { method: String, reason: String },
}

/// Terminal failures of an inference request.
///
/// A result that is still being computed is not an error; see
/// [`FetchOutcome::NotReady`](crate::FetchOutcome::NotReady).
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// The wallet was unavailable, the simulation reverted or the broadcast was rejected.
    #[error("submission failed: {0}")]
    Submission(String),

    /// The transaction was broadcast but no receipt showed up in time.
    #[error("transaction {tx_hash} was not mined within {timeout:?}")]
    MiningTimeout { tx_hash: B256, timeout: Duration },

    /// The receipt endpoint could not be reached or answered with a failure.
    #[error("receipt for {tx_hash} unavailable: {reason}")]
    Receipt { tx_hash: B256, reason: String },

    /// The receipt does not carry a request id where one is expected.
    #[error("malformed receipt for {tx_hash}: {reason}")]
    MalformedReceipt { tx_hash: B256, reason: String },

    /// Reading the request record from the contract failed.
    #[error("read failed: {0}")]
    Read(String),

    /// The polling budget ran out before the result was written.
    #[error("no result for request {request_id} after {attempts} attempts")]
    Timeout { request_id: RequestId, attempts: u32 },

    /// Polling was aborted by the caller. The request id stays valid.
    #[error("polling for request {0} was cancelled")]
    Cancelled(RequestId),

    /// The config file, an environment override or a CLI value was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl OracleError {
    /// Returns `true` when the on-chain request may still resolve later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OracleError::MiningTimeout { .. }
                | OracleError::Receipt { .. }
                | OracleError::Timeout { .. }
                | OracleError::Cancelled(_)
        )
    }

    /// The hash of a transaction that was already broadcast, when the error
    /// happened after the broadcast.
    pub fn tx_hash(&self) -> Option<B256> {
        match self {
            OracleError::MiningTimeout { tx_hash, .. }
            | OracleError::Receipt { tx_hash, .. }
            | OracleError::MalformedReceipt { tx_hash, .. } => Some(*tx_hash),
            _ => None,
        }
    }
}
