use crate::{
    client::OracleClient,
    contract::RpcOracleContract,
    error::OracleError,
    model::ModelSelector,
    receipt::{ProxyReceiptSource, ReceiptSource, RpcReceiptSource},
    rpc::RpcClient,
    wallet::{JsonRpcWallet, WalletSigner},
};
use alloy_primitives::{Address, U256, address, utils::parse_ether};
use serde::Deserialize;
use std::{path::Path, sync::Arc, time::Duration};

/// The deployed prompt inference contract on Manta Pacific Sepolia.
pub const DEFAULT_CONTRACT_ADDRESS: Address = address!("93012953008ef9AbcB71F48C340166E8f384e985");
pub const DEFAULT_FEE_ETHER: &str = "0.011";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_RECEIPT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

const ENV_RPC_URL: &str = "HOMY_RPC_URL";
const ENV_WALLET_URL: &str = "HOMY_WALLET_URL";
const ENV_CONTRACT_ADDRESS: &str = "HOMY_CONTRACT_ADDRESS";
const ENV_RECEIPT_PROXY_URL: &str = "HOMY_RECEIPT_PROXY_URL";
const ENV_MINING_TIMEOUT_SECS: &str = "HOMY_MINING_TIMEOUT_SECS";

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    pub fallback_rpc_url: Option<String>,
    pub explorer_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl ChainConfig {
    pub fn manta_pacific_sepolia() -> Self {
        Self {
            chain_id: 3_441_006,
            name: "Manta Pacific Sepolia".to_string(),
            rpc_url: "https://pacific-rpc.sepolia-testnet.manta.network/http".to_string(),
            fallback_rpc_url: None,
            explorer_url: Some("https://pacific-explorer.sepolia-testnet.manta.network".to_string()),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }

    pub fn tx_url(&self, tx_hash: &str) -> Option<String> {
        self.explorer_url
            .as_deref()
            .map(|base| format!("{}/tx/{tx_hash}", base.trim_end_matches('/')))
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::manta_pacific_sepolia()
    }
}

/// Bounded retry policy for reading a result that may not be written yet.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl PollPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn budget(&self) -> Duration {
        self.interval().saturating_mul(self.max_attempts)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// How long a submission may wait for its transaction to be mined. Has no
/// default; every caller picks its own bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitPolicy {
    pub mining_timeout: Duration,
}

impl SubmitPolicy {
    pub fn new(mining_timeout: Duration) -> Self {
        Self { mining_timeout }
    }
}

fn default_contract_address() -> Address {
    DEFAULT_CONTRACT_ADDRESS
}

fn default_fee_ether() -> String {
    DEFAULT_FEE_ETHER.to_string()
}

fn default_receipt_poll_interval_ms() -> u64 {
    DEFAULT_RECEIPT_POLL_INTERVAL_MS
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OracleConfig {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default = "default_contract_address")]
    pub contract_address: Address,
    /// Value attached to each request, in whole native units.
    #[serde(default = "default_fee_ether")]
    pub fee_ether: String,
    #[serde(default)]
    pub models: ModelSelector,
    #[serde(default)]
    pub poll: PollPolicy,
    /// Upper bound on the wait for a submitted transaction to be mined.
    pub mining_timeout_secs: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
    /// Serve receipts from `{url}/api/transaction/{hash}` instead of the node.
    #[serde(default)]
    pub receipt_proxy_url: Option<String>,
    /// Wallet JSON-RPC endpoint; the node itself when unset.
    #[serde(default)]
    pub wallet_url: Option<String>,
    #[serde(default)]
    pub account: Option<Address>,
}

impl OracleConfig {
    /// Defaults for Manta Pacific Sepolia. The mining timeout is stored in
    /// whole seconds, rounded up.
    pub fn new(mining_timeout: Duration) -> Self {
        Self {
            chain: ChainConfig::default(),
            contract_address: DEFAULT_CONTRACT_ADDRESS,
            fee_ether: default_fee_ether(),
            models: ModelSelector::default(),
            poll: PollPolicy::default(),
            mining_timeout_secs: mining_timeout.as_secs()
                + u64::from(mining_timeout.subsec_nanos() > 0),
            receipt_poll_interval_ms: DEFAULT_RECEIPT_POLL_INTERVAL_MS,
            receipt_proxy_url: None,
            wallet_url: None,
            account: None,
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, OracleError> {
        serde_json::from_str(raw).map_err(|error| OracleError::Config(error.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OracleError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| {
            OracleError::Config(format!("failed to read {}: {error}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Applies `HOMY_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), OracleError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), OracleError> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = get(ENV_RPC_URL) {
            self.chain.rpc_url = url;
        }
        if let Some(url) = get(ENV_WALLET_URL) {
            self.wallet_url = Some(url);
        }
        if let Some(url) = get(ENV_RECEIPT_PROXY_URL) {
            self.receipt_proxy_url = Some(url);
        }
        if let Some(raw) = get(ENV_CONTRACT_ADDRESS) {
            self.contract_address = raw.trim().parse().map_err(|error| {
                OracleError::Config(format!("{ENV_CONTRACT_ADDRESS}={raw}: {error}"))
            })?;
        }
        if let Some(raw) = get(ENV_MINING_TIMEOUT_SECS) {
            self.mining_timeout_secs = raw.trim().parse().map_err(|error| {
                OracleError::Config(format!("{ENV_MINING_TIMEOUT_SECS}={raw}: {error}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), OracleError> {
        let is_http = |url: &str| url.starts_with("http://") || url.starts_with("https://");

        if !is_http(self.chain.rpc_url.trim()) {
            return Err(OracleError::Config(format!(
                "rpc url must be http(s), got {:?}",
                self.chain.rpc_url
            )));
        }
        for url in [&self.receipt_proxy_url, &self.wallet_url, &self.chain.fallback_rpc_url]
            .into_iter()
            .flatten()
        {
            if !is_http(url.trim()) {
                return Err(OracleError::Config(format!("url must be http(s), got {url:?}")));
            }
        }
        if self.mining_timeout_secs == 0 {
            return Err(OracleError::Config(
                "mining_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.poll.max_attempts == 0 {
            return Err(OracleError::Config(
                "poll.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.receipt_poll_interval_ms == 0 {
            return Err(OracleError::Config(
                "receipt_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        self.fee_wei()?;
        Ok(())
    }

    pub fn fee_wei(&self) -> Result<U256, OracleError> {
        parse_ether(self.fee_ether.trim())
            .map_err(|error| OracleError::Config(format!("fee {:?}: {error}", self.fee_ether)))
    }

    pub fn submit_policy(&self) -> SubmitPolicy {
        SubmitPolicy::new(Duration::from_secs(self.mining_timeout_secs))
    }

    /// Builds a client wired to the configured node, wallet and receipt source.
    pub fn connect(&self) -> Result<OracleClient, OracleError> {
        self.validate()?;
        let request_timeout = Duration::from_millis(self.chain.request_timeout_ms);
        let rpc_client = |url: &str, fallback: Option<String>| {
            RpcClient::new(url.trim(), fallback, request_timeout)
                .map(Arc::new)
                .map_err(|error| OracleError::Config(error.to_string()))
        };

        let node = rpc_client(&self.chain.rpc_url, self.chain.fallback_rpc_url.clone())?;
        let wallet_rpc = match self.wallet_url.as_deref() {
            Some(url) => rpc_client(url, None)?,
            None => node.clone(),
        };
        let wallet: Arc<dyn WalletSigner> = Arc::new(match self.account {
            Some(account) => JsonRpcWallet::with_account(wallet_rpc, account),
            None => JsonRpcWallet::new(wallet_rpc),
        });
        let contract = Arc::new(RpcOracleContract::new(
            node.clone(),
            wallet,
            self.contract_address,
            self.fee_wei()?,
        ));
        let receipts: Arc<dyn ReceiptSource> = match self.receipt_proxy_url.as_deref() {
            Some(url) => Arc::new(ProxyReceiptSource::new(reqwest::Client::new(), url.trim())),
            None => Arc::new(RpcReceiptSource::new(
                node,
                Duration::from_millis(self.receipt_poll_interval_ms),
            )),
        };

        log::info!(
            "homy oracle at {} on {} ({})",
            self.contract_address,
            self.chain.name,
            self.chain.rpc_url
        );
        Ok(OracleClient::new(contract, receipts, self.submit_policy())
            .with_poll_policy(self.poll)
            .with_models(self.models))
    }
}
