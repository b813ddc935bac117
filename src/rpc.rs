use crate::error::RpcError;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Minimal JSON-RPC 2.0 client for an EVM node or wallet endpoint.
///
/// Requests go to the primary url first and are retried once against the
/// fallback url if the primary cannot be reached.
#[derive(Debug)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    fallback_url: Option<String>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(
        url: impl Into<String>,
        fallback_url: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|source| RpcError::Transport {
                method: "client_build".to_string(),
                source,
            })?;
        Ok(Self::with_http(http, url, fallback_url))
    }

    pub fn with_http(
        http: reqwest::Client,
        url: impl Into<String>,
        fallback_url: Option<String>,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            fallback_url,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Calls `method` and deserializes its `result` field.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = match self.post(&self.url, method, &body).await {
            Ok(response) => response,
            Err(primary) => match self.fallback_url.as_deref() {
                Some(fallback) => {
                    log::warn!("primary rpc failed for {method}: {primary}; trying fallback");
                    self.post(fallback, method, &body).await?
                }
                None => return Err(primary),
            },
        };

        if let Some(error) = response.get("error") {
            return Err(RpcError::Node {
                method: method.to_string(),
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        let result = response.get("result").cloned().ok_or_else(|| RpcError::Decode {
            method: method.to_string(),
            reason: "result was missing".to_string(),
        })?;
        serde_json::from_value(result).map_err(|error| RpcError::Decode {
            method: method.to_string(),
            reason: error.to_string(),
        })
    }

    async fn post(&self, url: &str, method: &str, body: &Value) -> Result<Value, RpcError> {
        log::debug!("rpc {method} -> {url}");
        let transport = |source| RpcError::Transport {
            method: method.to_string(),
            source,
        };
        self.http
            .post(url)
            .json(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transport)?
            .json::<Value>()
            .await
            .map_err(transport)
    }
}

/// Parses a `0x`-prefixed hex quantity.
pub fn parse_hex_u64(raw: &str, field: &str) -> Result<u64, String> {
    let value = raw.trim();
    let without_prefix = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| format!("{field} must be 0x-prefixed hex"))?;
    u64::from_str_radix(without_prefix, 16)
        .map_err(|error| format!("failed to parse {field} as hex u64: {error}"))
}

/// Decodes a `0x`-prefixed hex blob into bytes.
pub fn parse_hex_bytes(raw: &str, field: &str) -> Result<Vec<u8>, String> {
    let value = raw.trim();
    let without_prefix = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| format!("{field} must be 0x-prefixed hex"))?;
    hex::decode(without_prefix).map_err(|error| format!("{field} must be valid hex: {error}"))
}
