//! Client for the Homy on-chain inference oracle.
//!
//! A prompt is submitted as a payable contract call. Once the transaction is
//! mined, the request id is read from its receipt, and the contract is polled
//! until the off-chain computation writes the answer back.
//!
//! [`OracleClient`] exposes each step. [`HomyEngine`] runs whole requests in
//! the background for callers that need to poll without blocking.

pub mod abi;
pub mod assistant;
pub mod client;
pub mod config;
pub mod contract;
pub mod engine;
pub mod error;
pub mod model;
pub mod receipt;
pub mod rpc;
pub mod wallet;

pub use assistant::{ChatMessage, ChatRole, ChatSession, plan_prompt, proposal_prompt};
pub use client::{CancelHandle, CancelSignal, FetchOutcome, OracleClient, cancel_pair};
pub use config::{ChainConfig, OracleConfig, PollPolicy, SubmitPolicy};
pub use contract::{OracleContract, RpcOracleContract};
pub use engine::{HomyEngine, HomyEngineFailure, HomyEngineResponse, HomyEngineResult, RequestPhase};
pub use error::{OracleError, RpcError};
pub use model::{InferenceRecord, InferenceTicket, ModelSelector, Receipt, RequestId};
pub use receipt::{
    ProxyReceiptSource, ReceiptSource, RequestIdLayout, RpcReceiptSource, extract_request_id,
};
pub use wallet::{JsonRpcWallet, WalletSigner};
