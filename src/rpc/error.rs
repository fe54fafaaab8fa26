//! Error types for node RPC calls.

use thiserror::Error;

/// Errors that can occur while talking to a single node endpoint.
///
/// None of these escape the RPC layer: transport failures take the endpoint out of
/// rotation and the call is retried elsewhere, while malformed payloads are logged and
/// reported to the caller as "not found".
#[derive(Debug, Error)]
pub enum RpcError {
    /// The HTTP request failed due to a network or connection error.
    ///
    /// This typically indicates connectivity issues such as:
    /// - Connection refused (node not running)
    /// - Connection timeout
    /// - DNS resolution failure
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// An error occurred in the HTTP middleware layer.
    ///
    /// The middleware handles transient retries; this error may indicate that all retry
    /// attempts have been exhausted.
    #[error("Middleware error: {0}")]
    MiddlewareError(#[from] reqwest_middleware::Error),

    /// The node returned a non-success HTTP status code.
    #[error("Server error {status}: {body}")]
    ServerError {
        /// The HTTP status code returned by the node.
        status: reqwest::StatusCode,
        /// The response body, which may contain error details.
        body: String,
    },

    /// Failed to serialize the request or deserialize the response.
    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl RpcError {
    /// Whether the endpoint itself should be considered unreachable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::RequestFailed(_) | RpcError::MiddlewareError(_) | RpcError::ServerError { .. }
        )
    }
}
