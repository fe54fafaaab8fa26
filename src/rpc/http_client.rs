use std::time::{Duration, Instant};

use log::trace;
use serde::de::DeserializeOwned;
use url::Url;

use super::error::RpcError;
use super::types::{JsonRpcRequest, JsonRpcResponse, RpcParam};

pub const DEFAULT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_MAX_RETRIES: u32 = 0;

/// Transport shared by every endpoint. Which node to talk to is chosen per call.
pub struct HttpClient {
    client: reqwest_middleware::ClientWithMiddleware,
}

impl HttpClient {
    pub fn new() -> Result<Self, anyhow::Error> {
        Self::with_config(DEFAULT_MAX_RETRIES, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_config(max_retries: u32, timeout: Duration) -> Result<Self, anyhow::Error> {
        let retry_policy = reqwest_retry::policies::ExponentialBackoff::builder().build_with_max_retries(max_retries);

        let inner_client = reqwest::Client::builder().timeout(timeout).build()?;

        let client = reqwest_middleware::ClientBuilder::new(inner_client)
            .with(reqwest_retry::RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { client })
    }

    /// Sends a JSON-RPC request to `url`.
    ///
    /// Returns `Ok(None)` when the node answered but had no result (an error object or a
    /// `null` result), which callers treat as "not found".
    pub async fn call<T: DeserializeOwned>(
        &self,
        url: &Url,
        method: &str,
        params: &[RpcParam],
    ) -> Result<Option<T>, RpcError> {
        let start = Instant::now();
        let body = serde_json::to_string(&JsonRpcRequest::new(method, params))?;

        let resp = self
            .client
            .post(url.clone())
            .body(body)
            .header("Content-Type", "application/json")
            .send()
            .await?;
        trace!(url:% = url, method = method, latency_ms = start.elapsed().as_millis() as u64; "RPC response");

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read response body".into());
            return Err(RpcError::ServerError { status, body });
        }

        let text = resp.text().await?;
        let parsed: JsonRpcResponse<T> = serde_json::from_str(&text)?;
        if let Some(err) = parsed.error {
            trace!(url:% = url, method = method, code = err.code, message = &*err.message; "Node returned an error object");
            return Ok(None);
        }
        Ok(parsed.result)
    }
}
