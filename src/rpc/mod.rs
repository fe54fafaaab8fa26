//! JSON-RPC access to NEO full nodes.
//!
//! This module covers everything between the indexer and the remote nodes: the transport
//! client, the pool of endpoints with their last known heights, and the failover loop that
//! turns "some endpoint answered" into a single result for the caller.
//!
//! # Architecture
//!
//! - [`HttpClient`] - Sends one JSON-RPC request to one endpoint, with a per-call timeout
//! - [`EndpointPool`] - Tracks endpoint heights, refreshed every few seconds in the background
//! - [`NodeClient`] - Picks a qualifying endpoint, retries elsewhere on transport failure
//! - [`RpcError`] - Failure modes of a single request
//!
//! # Not found versus unavailable
//!
//! A node asked for a block above its tip answers with a JSON-RPC error object. That is a
//! normal "not found" (`Ok(None)`) and the endpoint stays in rotation. Transport failures
//! and non-success HTTP statuses mark the endpoint unreachable until the next refresh.

mod client;
mod error;
mod http_client;
mod pool;
pub mod types;

pub use client::{NodeClient, WhenNoEndpoint};
pub use error::RpcError;
pub use http_client::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS, HttpClient};
pub use pool::EndpointPool;
pub use types::{JsonRpcRequest, JsonRpcResponse, RawBlock, RpcParam};
