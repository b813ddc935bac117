use crate::{
    error::OracleError,
    model::TransactionRequest,
    rpc::RpcClient,
};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde_json::json;
use std::{str::FromStr, sync::Arc};
use tokio::sync::OnceCell;

/// Something that holds an account and can sign and broadcast transactions
/// for it.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    /// The account transactions are sent from.
    async fn account(&self) -> Result<Address, OracleError>;

    /// Signs and broadcasts `tx`, returning the transaction hash.
    async fn send_transaction(&self, tx: &TransactionRequest) -> Result<B256, OracleError>;
}

/// A wallet reached over JSON-RPC that manages its own keys, such as a
/// browser-extension bridge or a dev node with unlocked accounts.
///
/// The account is looked up on first use and memoized.
pub struct JsonRpcWallet {
    rpc: Arc<RpcClient>,
    account: OnceCell<Address>,
}

impl JsonRpcWallet {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self {
            rpc,
            account: OnceCell::new(),
        }
    }

    /// Pins the wallet to a known account and skips the `eth_accounts` lookup.
    pub fn with_account(rpc: Arc<RpcClient>, account: Address) -> Self {
        Self {
            rpc,
            account: OnceCell::new_with(Some(account)),
        }
    }

    async fn lookup_account(&self) -> Result<Address, OracleError> {
        let accounts: Vec<String> = self
            .rpc
            .call("eth_accounts", json!([]))
            .await
            .map_err(|error| OracleError::Submission(format!("wallet unavailable: {error}")))?;
        let first = accounts
            .first()
            .ok_or_else(|| OracleError::Submission("wallet exposes no accounts".to_string()))?;
        Address::from_str(first).map_err(|error| {
            OracleError::Submission(format!("wallet returned invalid account {first}: {error}"))
        })
    }
}

#[async_trait]
impl WalletSigner for JsonRpcWallet {
    async fn account(&self) -> Result<Address, OracleError> {
        self.account
            .get_or_try_init(|| self.lookup_account())
            .await
            .copied()
    }

    async fn send_transaction(&self, tx: &TransactionRequest) -> Result<B256, OracleError> {
        let raw: String = self
            .rpc
            .call("eth_sendTransaction", json!([tx.to_rpc_json()]))
            .await
            .map_err(|error| OracleError::Submission(format!("broadcast rejected: {error}")))?;
        B256::from_str(&raw).map_err(|error| {
            OracleError::Submission(format!("wallet returned invalid tx hash {raw}: {error}"))
        })
    }
}
