use alloy_primitives::B256;
use argh::FromArgs;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use homy_oracle::{ChainConfig, ReceiptSource, RpcReceiptSource, rpc::RpcClient};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc, time::Duration};

// defaults for the server
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_RECEIPT_POLL_INTERVAL_MS: u64 = 2_000;

#[derive(FromArgs)]
/// Serves transaction receipts, waiting for each transaction to be mined.
struct ProxyArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// the node to read receipts from
    #[argh(option, short = 'r', default = "ChainConfig::default().rpc_url")]
    rpc_url: String,

    /// how often the node is asked for a pending receipt, in milliseconds
    #[argh(option, default = "DEFAULT_RECEIPT_POLL_INTERVAL_MS")]
    poll_interval_ms: u64,

    /// how long a single request may wait for mining, in seconds
    #[argh(option, short = 't')]
    mining_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

struct ProxyState {
    receipts: RpcReceiptSource,
    mining_timeout: Duration,
}

fn error_response(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

async fn get_transaction(
    State(state): State<Arc<ProxyState>>,
    Path(hash): Path<String>,
) -> Response {
    let Ok(tx_hash) = B256::from_str(hash.trim()) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid transaction hash");
    };

    match tokio::time::timeout(state.mining_timeout, state.receipts.wait_for_receipt(tx_hash))
        .await
    {
        Ok(Ok(receipt)) => {
            log::info!("Serving receipt for {tx_hash}");
            (StatusCode::OK, Json(receipt)).into_response()
        }
        Ok(Err(error)) => {
            log::error!("Error fetching transaction receipt: {error}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch transaction receipt",
            )
        }
        Err(_) => {
            log::warn!("Transaction {tx_hash} not mined within {:?}", state.mining_timeout);
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Transaction was not mined in time",
            )
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ProxyArgs = argh::from_env();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let chain = ChainConfig::default();
    let rpc = RpcClient::new(
        args.rpc_url.clone(),
        None,
        Duration::from_millis(chain.request_timeout_ms),
    )?;
    let state = Arc::new(ProxyState {
        receipts: RpcReceiptSource::new(
            Arc::new(rpc),
            Duration::from_millis(args.poll_interval_ms),
        ),
        mining_timeout: Duration::from_secs(args.mining_timeout_secs),
    });

    let app = Router::new()
        .route("/", get(|| async { "Homy receipt proxy" }))
        .route("/api/transaction/{hash}", get(get_transaction))
        .with_state(state);

    log::info!("Starting the receipt proxy");
    log::info!("Listening on: {}", addr);
    log::info!("Reading receipts from: {}", args.rpc_url);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
