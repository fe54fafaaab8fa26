pub mod cache;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod log;
pub mod models;
pub mod pipelines;
pub mod progress;
pub mod rpc;
pub mod script;
pub mod sync;

pub use crate::config::IndexerConfig;
pub use crate::daemon::Daemon;
pub use crate::db::init_db;
pub use crate::error::IndexerError;
