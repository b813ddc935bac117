use alloy_primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{fmt, str::FromStr};

/// Identifier the oracle contract assigns to an inference request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub U256);

impl RequestId {
    pub fn new(value: U256) -> Self {
        Self(value)
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }
}

impl From<U256> for RequestId {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = String;

    /// Accepts decimal or `0x`-prefixed hex.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("request id cannot be empty".to_string());
        }
        U256::from_str(trimmed)
            .map(Self)
            .map_err(|error| format!("invalid request id {trimmed}: {error}"))
    }
}

/// The pair of model identifiers combined by the oracle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModelSelector {
    pub first: u64,
    pub second: u64,
}

impl ModelSelector {
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new(11, 50)
    }
}

/// The pieces a caller needs to recover a result out-of-band.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InferenceTicket {
    pub tx_hash: B256,
    pub request_id: RequestId,
}

/// Outcome of a mined transaction as reported by a receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Reverted,
    Unknown,
}

/// A mined transaction receipt.
///
/// Both the node encoding (`"0x1"`, hex block numbers) and the proxy
/// encoding (`"success"`, decimal block numbers) are accepted.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: B256,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub logs: Vec<Log>,
}

impl Receipt {
    pub fn status(&self) -> ReceiptStatus {
        match self
            .status
            .as_deref()
            .map(|raw| raw.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("0x1" | "1" | "success") => ReceiptStatus::Success,
            Some("0x0" | "0" | "reverted") => ReceiptStatus::Reverted,
            _ => ReceiptStatus::Unknown,
        }
    }

    pub fn block_number(&self) -> Option<u64> {
        let raw = self.block_number.as_deref()?.trim();
        match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => raw.parse().ok(),
        }
    }
}

/// An event emitted while executing a transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Log {
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: Option<String>,
}

/// The request record the oracle contract stores per request id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InferenceRecord {
    pub sender: Address,
    pub model_id: U256,
    pub input: Bytes,
    pub output: Bytes,
}

impl InferenceRecord {
    /// Unknown keys read back as a zeroed struct.
    pub fn exists(&self) -> bool {
        self.sender != Address::ZERO || !self.input.is_empty()
    }

    pub fn is_resolved(&self) -> bool {
        !self.output.is_empty()
    }
}

/// A contract call to be signed and broadcast by a wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas: Option<u64>,
}

impl TransactionRequest {
    pub fn to_rpc_json(&self) -> Value {
        let mut tx = json!({
            "from": self.from.to_string(),
            "to": self.to.to_string(),
            "value": format!("0x{:x}", self.value),
            "data": format!("0x{}", hex::encode(&self.data)),
        });
        if let Some(gas) = self.gas {
            tx["gas"] = Value::String(format!("0x{gas:x}"));
        }
        tx
    }
}
