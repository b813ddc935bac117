use crate::{
    error::{OracleError, RpcError},
    model::{Receipt, RequestId},
    rpc::RpcClient,
};
use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use serde_json::json;
use std::{str::FromStr, sync::Arc, time::Duration};

/// Where the receipt of a mined transaction comes from.
///
/// Implementations may wait for the transaction to be mined. Callers bound
/// that wait themselves.
#[async_trait]
pub trait ReceiptSource: Send + Sync {
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<Receipt, OracleError>;
}

/// Polls `eth_getTransactionReceipt` until the node reports the receipt.
///
/// Transport failures and node errors are retried on the same interval as a
/// pending receipt. Only a response that cannot be decoded ends the wait.
pub struct RpcReceiptSource {
    rpc: Arc<RpcClient>,
    poll_interval: Duration,
}

impl RpcReceiptSource {
    /// `poll_interval` spaces both pending and failed lookups.
    pub fn new(rpc: Arc<RpcClient>, poll_interval: Duration) -> Self {
        Self { rpc, poll_interval }
    }
}

#[async_trait]
impl ReceiptSource for RpcReceiptSource {
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<Receipt, OracleError> {
        loop {
            let result: Result<Option<Receipt>, RpcError> = self
                .rpc
                .call("eth_getTransactionReceipt", json!([tx_hash.to_string()]))
                .await;
            match result {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => log::debug!("transaction {tx_hash} not mined yet"),
                Err(error @ (RpcError::Transport { .. } | RpcError::Node { .. })) => {
                    log::warn!("receipt for {tx_hash} unavailable, retrying: {error}");
                }
                Err(error) => {
                    return Err(OracleError::MalformedReceipt {
                        tx_hash,
                        reason: error.to_string(),
                    });
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Fetches receipts from an HTTP endpoint that itself waits for mining,
/// served at `{base_url}/api/transaction/{hash}`.
pub struct ProxyReceiptSource {
    http: reqwest::Client,
    base_url: String,
}

impl ProxyReceiptSource {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// The endpoint queried for `tx_hash`.
    pub fn receipt_url(&self, tx_hash: B256) -> String {
        format!("{}/api/transaction/{tx_hash}", self.base_url)
    }
}

#[async_trait]
impl ReceiptSource for ProxyReceiptSource {
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<Receipt, OracleError> {
        let response = self
            .http
            .get(self.receipt_url(tx_hash))
            .send()
            .await
            .map_err(|error| OracleError::Receipt {
                tx_hash,
                reason: error.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(OracleError::Receipt {
                tx_hash,
                reason: format!("receipt proxy returned status {}", response.status()),
            });
        }
        response
            .json::<Receipt>()
            .await
            .map_err(|error| OracleError::MalformedReceipt {
                tx_hash,
                reason: error.to_string(),
            })
    }
}

/// Where in a receipt the oracle contract puts the request id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestIdLayout {
    /// Index into `receipt.logs`.
    pub log_index: usize,
    /// Index into that log's topics.
    pub topic_index: usize,
}

impl RequestIdLayout {
    /// The request event is the first log, with the id as its first indexed
    /// argument (topic 1, after the event signature).
    pub const V1: Self = Self {
        log_index: 0,
        topic_index: 1,
    };

    /// Reads the id as a big-endian 256-bit word. Missing logs, missing
    /// topics and topics that are not 32-byte hex are malformed.
    pub fn extract(&self, receipt: &Receipt) -> Result<RequestId, OracleError> {
        let malformed = |reason: String| OracleError::MalformedReceipt {
            tx_hash: receipt.transaction_hash,
            reason,
        };
        if receipt.logs.is_empty() {
            return Err(malformed("receipt has no logs".to_string()));
        }
        let log = receipt.logs.get(self.log_index).ok_or_else(|| {
            malformed(format!(
                "receipt has {} logs, expected an entry at {}",
                receipt.logs.len(),
                self.log_index
            ))
        })?;
        let topic = log.topics.get(self.topic_index).ok_or_else(|| {
            malformed(format!(
                "log {} has {} topics, expected an entry at {}",
                self.log_index,
                log.topics.len(),
                self.topic_index
            ))
        })?;
        let word = B256::from_str(topic.trim())
            .map_err(|error| malformed(format!("topic {topic} is not a 32-byte value: {error}")))?;
        Ok(RequestId(U256::from_be_slice(word.as_slice())))
    }
}

/// Reads the request id out of a receipt using [`RequestIdLayout::V1`].
pub fn extract_request_id(receipt: &Receipt) -> Result<RequestId, OracleError> {
    RequestIdLayout::V1.extract(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Log;

    const EVENT_SIGNATURE_TOPIC: &str =
        "0x5c9d2a7b1f8e4d6c3b2a1908f7e6d5c4b3a29180f7e6d5c4b3a29180f7e6d5c4";

    fn receipt_with_logs(logs: Vec<Log>) -> Receipt {
        Receipt {
            transaction_hash: B256::repeat_byte(0xab),
            status: Some("0x1".to_string()),
            block_number: Some("0x1".to_string()),
            logs,
        }
    }

    fn log_with_topics(topics: &[&str]) -> Log {
        Log {
            topics: topics.iter().map(|topic| topic.to_string()).collect(),
            ..Log::default()
        }
    }

    #[test]
    fn extracts_second_topic_of_first_log() {
        let receipt = receipt_with_logs(vec![
            log_with_topics(&[
                EVENT_SIGNATURE_TOPIC,
                "0x000000000000000000000000000000000000000000000000000000000000002a",
            ]),
            log_with_topics(&[
                EVENT_SIGNATURE_TOPIC,
                "0x00000000000000000000000000000000000000000000000000000000000000ff",
            ]),
        ]);
        assert_eq!(extract_request_id(&receipt).unwrap(), RequestId::from(42));
        // deterministic for the same receipt
        assert_eq!(extract_request_id(&receipt).unwrap(), RequestId::from(42));
    }

    #[test]
    fn full_width_topic_is_preserved() {
        let topic = format!("0x{}", "ff".repeat(32));
        let receipt = receipt_with_logs(vec![log_with_topics(&[EVENT_SIGNATURE_TOPIC, &topic])]);
        assert_eq!(extract_request_id(&receipt).unwrap().as_u256(), U256::MAX);
    }

    #[test]
    fn empty_logs_are_malformed() {
        let receipt = receipt_with_logs(Vec::new());
        for _ in 0..3 {
            assert!(matches!(
                extract_request_id(&receipt),
                Err(OracleError::MalformedReceipt { .. })
            ));
        }
    }

    #[test]
    fn missing_or_undecodable_topic_is_malformed() {
        let missing = receipt_with_logs(vec![log_with_topics(&[EVENT_SIGNATURE_TOPIC])]);
        assert!(matches!(
            extract_request_id(&missing),
            Err(OracleError::MalformedReceipt { .. })
        ));

        let short = receipt_with_logs(vec![log_with_topics(&[EVENT_SIGNATURE_TOPIC, "0x2a"])]);
        assert!(matches!(
            extract_request_id(&short),
            Err(OracleError::MalformedReceipt { .. })
        ));
    }

    #[test]
    fn custom_layout_reads_other_positions() {
        let layout = RequestIdLayout {
            log_index: 1,
            topic_index: 2,
        };
        let receipt = receipt_with_logs(vec![
            log_with_topics(&[EVENT_SIGNATURE_TOPIC]),
            log_with_topics(&[
                EVENT_SIGNATURE_TOPIC,
                EVENT_SIGNATURE_TOPIC,
                "0x0000000000000000000000000000000000000000000000000000000000000007",
            ]),
        ]);
        assert_eq!(layout.extract(&receipt).unwrap(), RequestId::from(7));
        assert!(RequestIdLayout::V1.extract(&receipt).is_err());
    }

    #[test]
    fn proxy_url_joins_base_and_hash() {
        let source = ProxyReceiptSource::new(reqwest::Client::new(), "http://localhost:3000/");
        assert_eq!(
            source.receipt_url(B256::ZERO),
            format!("http://localhost:3000/api/transaction/0x{}", "00".repeat(32))
        );
    }
}
