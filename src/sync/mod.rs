//! Block ingestion: download, reorder, persist.
//!
//! [`FetchWorkers`] race ahead on heights handed out by the [`BlockBuffer`], the
//! [`Arranger`] pops them back out strictly in order, and the [`Persister`] commits them in
//! batches together with their balance effects.

pub mod arranger;
pub mod buffer;
pub mod ingest;
pub mod persister;
pub mod workers;

pub use arranger::Arranger;
pub use buffer::BlockBuffer;
pub use ingest::{BatchSummary, IngestContext, store_batch};
pub use persister::Persister;
pub use workers::FetchWorkers;
