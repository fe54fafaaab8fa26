use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::anyhow;
use log::{info, warn};
use tokio::sync::mpsc;

use super::buffer::BlockBuffer;
use super::ingest::{IngestContext, store_batch};
use crate::db::{DbError, SqlitePool};
use crate::error::IndexerError;
use crate::models::{Height, Id};
use crate::progress::{ProgressTracker, SyncSignals};
use crate::rpc::{EndpointPool, RawBlock};

/// Blocks per commit while catching up.
pub const FLUSH_BLOCKS: usize = 15;

/// Sequential consumer of arranged blocks.
pub struct Persister {
    pool: SqlitePool,
    ctx: IngestContext,
    buffer: Arc<BlockBuffer>,
    endpoints: Arc<EndpointPool>,
    signals: Arc<SyncSignals>,
    progress: ProgressTracker,
    last_tx_pk: Id,
}

impl Persister {
    pub fn new(
        pool: SqlitePool,
        ctx: IngestContext,
        buffer: Arc<BlockBuffer>,
        endpoints: Arc<EndpointPool>,
        signals: Arc<SyncSignals>,
        last_tx_pk: Id,
    ) -> Self {
        let progress = ProgressTracker::new("blocks", Arc::new(AtomicBool::new(true)))
            .publish_synced(signals.blocks_synced());
        Self {
            pool,
            ctx,
            buffer,
            endpoints,
            signals,
            progress,
            last_tx_pk,
        }
    }

    /// Consumes blocks until the channel closes, which only happens if the arranger died.
    pub async fn run(mut self, mut rx: mpsc::Receiver<RawBlock>) -> Result<(), IndexerError> {
        info!(last_tx_pk = self.last_tx_pk; "Persister started");
        let mut batch = Vec::with_capacity(FLUSH_BLOCKS);

        while let Some(block) = rx.recv().await {
            let at_tip = block.index >= self.buffer.highest_height();
            batch.push(block);
            if batch.len() >= FLUSH_BLOCKS || at_tip {
                self.flush(std::mem::take(&mut batch)).await?;
            }
        }

        if !batch.is_empty() {
            self.flush(batch).await?;
        }
        warn!("Block channel closed");
        Err(IndexerError::Fatal(anyhow!("Arranger stopped sending blocks")))
    }

    async fn flush(&mut self, blocks: Vec<RawBlock>) -> Result<Height, IndexerError> {
        let pool = self.pool.clone();
        let ctx = self.ctx.clone();
        let last_tx_pk = self.last_tx_pk;

        let summary = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(DbError::from)?;
            store_batch(&mut conn, &ctx, &blocks, last_tx_pk)
        })
        .await??;

        self.last_tx_pk = summary.last_tx_pk;
        self.signals.raise_refresh();
        self.endpoints.raise_best_height(summary.last_height);

        self.progress.set_ceiling(self.endpoints.best_height());
        self.progress.report(summary.last_height);
        Ok(summary.last_height)
    }
}
