use crate::{
    abi,
    error::OracleError,
    model::{InferenceRecord, ModelSelector, RequestId, TransactionRequest},
    rpc::{RpcClient, parse_hex_bytes, parse_hex_u64},
    wallet::WalletSigner,
};
use alloy_primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Read/write access to the inference oracle contract.
#[async_trait]
pub trait OracleContract: Send + Sync {
    /// Simulates, signs and broadcasts a request. Does not wait for mining.
    async fn submit_inference(
        &self,
        selector: ModelSelector,
        prompt: &str,
    ) -> Result<B256, OracleError>;

    /// Reads the stored record for `request_id`.
    async fn read_request(&self, request_id: RequestId) -> Result<InferenceRecord, OracleError>;
}

/// [`OracleContract`] backed by a JSON-RPC node and a [`WalletSigner`].
pub struct RpcOracleContract {
    rpc: Arc<RpcClient>,
    wallet: Arc<dyn WalletSigner>,
    address: Address,
    fee_wei: U256,
}

impl RpcOracleContract {
    pub fn new(
        rpc: Arc<RpcClient>,
        wallet: Arc<dyn WalletSigner>,
        address: Address,
        fee_wei: U256,
    ) -> Self {
        Self {
            rpc,
            wallet,
            address,
            fee_wei,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn fee_wei(&self) -> U256 {
        self.fee_wei
    }

    /// Dry-runs the call and returns the gas it needs; a revert is reported
    /// here instead of on chain.
    async fn simulate(&self, tx: &TransactionRequest) -> Result<u64, OracleError> {
        let call = tx.to_rpc_json();
        let _: String = self
            .rpc
            .call("eth_call", json!([call, "latest"]))
            .await
            .map_err(|error| OracleError::Submission(format!("simulation reverted: {error}")))?;
        let gas: String = self
            .rpc
            .call("eth_estimateGas", json!([call]))
            .await
            .map_err(|error| OracleError::Submission(format!("gas estimation failed: {error}")))?;
        parse_hex_u64(&gas, "eth_estimateGas").map_err(OracleError::Submission)
    }
}

#[async_trait]
impl OracleContract for RpcOracleContract {
    async fn submit_inference(
        &self,
        selector: ModelSelector,
        prompt: &str,
    ) -> Result<B256, OracleError> {
        let from = self.wallet.account().await?;
        log::debug!(
            "submitting inference from {from} with models ({}, {})",
            selector.first,
            selector.second
        );

        let mut tx = TransactionRequest {
            from,
            to: self.address,
            value: self.fee_wei,
            data: Bytes::from(abi::encode_submit(selector, prompt)),
            gas: None,
        };
        tx.gas = Some(self.simulate(&tx).await?);

        let tx_hash = self.wallet.send_transaction(&tx).await?;
        log::info!("inference transaction sent: {tx_hash}");
        Ok(tx_hash)
    }

    async fn read_request(&self, request_id: RequestId) -> Result<InferenceRecord, OracleError> {
        let data = format!("0x{}", hex::encode(abi::encode_read(request_id)));
        let raw: String = self
            .rpc
            .call(
                "eth_call",
                json!([{ "to": self.address.to_string(), "data": data }, "latest"]),
            )
            .await
            .map_err(|error| OracleError::Read(format!("requests({request_id}): {error}")))?;
        let bytes = parse_hex_bytes(&raw, "requests result").map_err(OracleError::Read)?;
        abi::decode_read(&bytes)
            .map_err(|error| OracleError::Read(format!("requests({request_id}): {error}")))
    }
}
