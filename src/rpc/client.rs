use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use serde::de::DeserializeOwned;

use super::http_client::HttpClient;
use super::pool::EndpointPool;
use super::types::{RawBlock, RpcParam};
use crate::models::Height;

const RETRY_AFTER_TRANSPORT_ERROR: Duration = Duration::from_millis(50);
const RETRY_AFTER_NO_ENDPOINT: Duration = Duration::from_secs(3);

/// What to do when no endpoint is known to have the requested height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenNoEndpoint {
    /// Report "not found" straight away. Used for block downloads above the known tip.
    NotFound,
    /// Back off, print the pool status and try again.
    Wait,
}

/// Issues calls against whichever endpoint currently qualifies, failing over on errors.
pub struct NodeClient {
    pool: Arc<EndpointPool>,
    http: Arc<HttpClient>,
}

impl NodeClient {
    pub fn new(pool: Arc<EndpointPool>, http: Arc<HttpClient>) -> Self {
        Self { pool, http }
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    /// Calls `method` on an endpoint whose height is at least `min_height`.
    ///
    /// Transport failures take the endpoint out of rotation and the call is retried on
    /// another one, so this only returns once some node produced an answer. `None` means
    /// the node had no result, or the answer could not be decoded.
    pub async fn call<T: DeserializeOwned>(
        &self,
        min_height: Height,
        method: &str,
        params: &[RpcParam],
        when_none: WhenNoEndpoint,
    ) -> Option<T> {
        loop {
            let Some(url) = self.pool.select(min_height) else {
                if when_none == WhenNoEndpoint::NotFound {
                    return None;
                }
                warn!(method = method, min_height = min_height; "No endpoint available, waiting");
                tokio::time::sleep(RETRY_AFTER_NO_ENDPOINT).await;
                self.pool.log_status();
                continue;
            };

            match self.http.call::<T>(&url, method, params).await {
                Ok(result) => return result,
                Err(e) if e.is_transport() => {
                    warn!(endpoint:% = url, method = method, error:% = e; "Endpoint failed, switching");
                    self.pool.mark_unavailable(&url);
                    tokio::time::sleep(RETRY_AFTER_TRANSPORT_ERROR).await;
                },
                Err(e) => {
                    error!(endpoint:% = url, method = method, error:% = e; "Could not decode node response");
                    return None;
                },
            }
        }
    }

    /// Downloads the block at `height`, or `None` if no endpoint has it yet.
    pub async fn download_block(&self, height: Height) -> Option<RawBlock> {
        let params = [RpcParam::Int(height), RpcParam::Int(1)];
        self.call(height, "getblock", &params, WhenNoEndpoint::NotFound)
            .await
    }
}
