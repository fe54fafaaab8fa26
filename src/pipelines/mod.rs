//! Downstream enrichment pipelines.
//!
//! Every pipeline re-reads already persisted transactions from its own durable cursor and
//! derives auxiliary rows from them. They share one shape:
//!
//! - a fetch stage pages transactions out of storage into a bounded channel, sleeping
//!   while there is nothing new;
//! - a handle stage turns each transaction into records and flushes them when the batch
//!   grows past a threshold or nothing new arrived for [`IDLE_FLUSH`].
//!
//! A flush writes the records and moves the cursor in the same storage transaction, so a
//! crash before the commit only means the same transactions are read again.
//!
//! # Pipelines
//!
//! - [`TxEffects`] - address activity, per-pair and per-asset transaction counters
//! - [`AssetTxIndex`] - the (address, asset, transaction) lookup table
//! - [`GasDailyBalance`] - running GAS balance per address and UTC date
//! - [`Nep5Transfers`] - NEP5 token transfers and balances
//! - [`SmartContracts`] - contract registration metadata

use std::time::{Duration, Instant as StdInstant};

use anyhow::anyhow;
use log::{debug, info, warn};
use rusqlite::Transaction;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until};

use crate::db::{self, Counter, DbError, SqlitePool};
use crate::error::IndexerError;
use crate::models::{Id, TxRecord};
use crate::progress::{ProgressTracker, SyncSignals};

mod asset_tx;
mod gas_balance;
mod nep5;
mod smart_contract;
mod tx_effects;

pub use asset_tx::AssetTxIndex;
pub use gas_balance::GasDailyBalance;
pub use nep5::Nep5Transfers;
pub use smart_contract::SmartContracts;
pub use tx_effects::TxEffects;

/// Flush after this long without a new item.
pub const IDLE_FLUSH: Duration = Duration::from_secs(2);

/// Fetch stage back-off once it has caught up with stored transactions.
pub const EMPTY_PAGE_DELAY: Duration = Duration::from_secs(2);

const CHANNEL_CAPACITY: usize = 1000;

/// Which persisted transactions a pipeline consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Transactions with at least one input or output, joined with them.
    Transfers,
    /// Invocation transactions, without inputs or outputs.
    Invocations,
}

impl Source {
    fn fetch(self, conn: &rusqlite::Connection, from: Id, limit: i64) -> db::DbResult<Vec<TxRecord>> {
        match self {
            Source::Transfers => db::fetch_tx_page(conn, from, limit),
            Source::Invocations => db::fetch_invocations(conn, from, limit),
        }
    }

    /// Highest pk [`Source::fetch`] can return; progress is measured against it.
    fn ceiling(self, conn: &rusqlite::Connection) -> db::DbResult<Id> {
        match self {
            Source::Transfers => db::max_transfer_tx_pk(conn),
            Source::Invocations => db::max_invocation_tx_pk(conn),
        }
    }
}

/// Business logic of one pipeline.
///
/// `process` runs on the async side and must not touch storage. `commit` runs on a blocking
/// thread inside the flush transaction; the cursor is written by the framework afterwards.
pub trait Handler: Send + 'static {
    type Record: Send + 'static;

    const NAME: &'static str;
    const CURSOR: Counter;
    const SOURCE: Source;
    const PAGE_SIZE: i64 = 1000;
    const FLUSH_THRESHOLD: usize = 1000;

    fn process(&mut self, tx: &TxRecord, records: &mut Vec<Self::Record>);

    fn commit(&mut self, db: &Transaction<'_>, records: Vec<Self::Record>) -> Result<(), IndexerError>;
}

/// Handle stage states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushState {
    AwaitingItems,
    Accumulating { deadline: Instant },
    Flushing,
}

/// Records accepted since the last flush, and the cursor they lead up to.
struct Batch<R> {
    records: Vec<R>,
    cursor: Id,
    pending: bool,
}

/// Runs a [`Handler`] against storage.
pub struct Pipeline<H: Handler> {
    pool: SqlitePool,
    handler: Option<H>,
    progress: ProgressTracker,
    committed: watch::Sender<Id>,
}

impl<H: Handler> Pipeline<H> {
    pub fn new(pool: SqlitePool, handler: H, signals: &SyncSignals) -> Self {
        let progress = ProgressTracker::new(H::NAME, signals.register()).with_upstream(signals.blocks_synced());
        let (committed, _) = watch::channel(0);
        Self {
            pool,
            handler: Some(handler),
            progress,
            committed,
        }
    }

    /// Follows the committed cursor.
    pub fn subscribe(&self) -> watch::Receiver<Id> {
        self.committed.subscribe()
    }

    pub async fn run(mut self) -> Result<(), IndexerError> {
        let cursor = db::read_with_retry(&self.pool, H::NAME, |conn| db::get_counter(conn, H::CURSOR)).await?;
        self.committed.send_replace(cursor);
        info!(pipeline = H::NAME, cursor = cursor; "Pipeline started");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let fetch = fetch_stage(self.pool.clone(), H::NAME, H::SOURCE, H::PAGE_SIZE, cursor, tx);
        let handle = self.handle_stage(rx, cursor);
        tokio::try_join!(fetch, handle)?;
        Ok(())
    }

    /// Consumes `rx` until it closes, flushing by size or idle time.
    async fn handle_stage(&mut self, mut rx: mpsc::Receiver<TxRecord>, cursor: Id) -> Result<(), IndexerError> {
        let mut batch = Batch {
            records: Vec::new(),
            cursor,
            pending: false,
        };
        let mut state = FlushState::AwaitingItems;

        loop {
            state = match state {
                FlushState::AwaitingItems => match rx.recv().await {
                    Some(tx) => self.accept(&mut batch, &tx)?,
                    None => break,
                },
                FlushState::Accumulating { deadline } => {
                    tokio::select! {
                        item = rx.recv() => match item {
                            Some(tx) => self.accept(&mut batch, &tx)?,
                            None => {
                                self.flush(&mut batch).await?;
                                break;
                            },
                        },
                        _ = sleep_until(deadline) => FlushState::Flushing,
                    }
                },
                FlushState::Flushing => {
                    self.flush(&mut batch).await?;
                    FlushState::AwaitingItems
                },
            };
        }

        warn!(pipeline = H::NAME; "Pipeline channel closed");
        Err(IndexerError::Fatal(anyhow!("{} fetch stage stopped", H::NAME)))
    }

    fn accept(&mut self, batch: &mut Batch<H::Record>, tx: &TxRecord) -> Result<FlushState, IndexerError> {
        let handler = self
            .handler
            .as_mut()
            .ok_or_else(|| IndexerError::Fatal(anyhow!("{} handler lost", H::NAME)))?;
        handler.process(tx, &mut batch.records);
        batch.cursor = tx.id;
        batch.pending = true;

        if batch.records.len() >= H::FLUSH_THRESHOLD {
            Ok(FlushState::Flushing)
        } else {
            Ok(FlushState::Accumulating {
                deadline: Instant::now() + IDLE_FLUSH,
            })
        }
    }

    /// Commits the batch and the cursor together. Batches that produced no records still
    /// commit so the cursor moves past them.
    async fn flush(&mut self, batch: &mut Batch<H::Record>) -> Result<(), IndexerError> {
        if !batch.pending {
            return Ok(());
        }
        let mut handler = self
            .handler
            .take()
            .ok_or_else(|| IndexerError::Fatal(anyhow!("{} handler lost", H::NAME)))?;
        let records = std::mem::take(&mut batch.records);
        let count = records.len();
        let cursor = batch.cursor;
        let pool = self.pool.clone();

        let handler = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(DbError::from)?;
            let db = db::write_transaction(&mut conn)?;
            handler.commit(&db, records)?;
            db::set_counter(&db, H::CURSOR, cursor)?;
            db.commit().map_err(DbError::from)?;
            Ok::<_, IndexerError>(handler)
        })
        .await??;

        self.handler = Some(handler);
        batch.pending = false;
        self.committed.send_replace(cursor);
        debug!(pipeline = H::NAME, cursor = cursor, records = count; "Pipeline batch committed");

        if self.progress.needs_ceiling() {
            let ceiling = db::read_with_retry(&self.pool, H::NAME, |conn| H::SOURCE.ceiling(conn)).await?;
            self.progress.set_ceiling(ceiling);
        }
        self.progress.report(cursor);
        Ok(())
    }
}

/// Pages transactions after `cursor` into `tx`. Only returns when the handle stage is gone
/// or a read fails for good.
async fn fetch_stage(
    pool: SqlitePool,
    name: &'static str,
    source: Source,
    page_size: i64,
    mut cursor: Id,
    tx: mpsc::Sender<TxRecord>,
) -> Result<(), IndexerError> {
    loop {
        let from = cursor + 1;
        let started = StdInstant::now();
        let page = db::read_with_retry(&pool, name, move |conn| source.fetch(conn, from, page_size)).await?;

        let Some(last) = page.last().map(|t| t.id) else {
            sleep(EMPTY_PAGE_DELAY).await;
            continue;
        };
        debug!(
            pipeline = name,
            from = from,
            txs = page.len(),
            elapsed_ms = started.elapsed().as_millis() as u64;
            "Fetched page"
        );

        for record in page {
            if tx.send(record).await.is_err() {
                return Err(IndexerError::Fatal(anyhow!("{} handle stage stopped", name)));
            }
        }
        cursor = last;
    }
}

/// Test helpers shared by the pipeline modules.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::sync::IngestContext;
    use crate::sync::store_batch;
    use crate::rpc::RawBlock;

    /// Stores `blocks` as one batch after whatever is already stored.
    pub fn store(pool: &SqlitePool, ctx: &IngestContext, blocks: &[RawBlock]) -> Id {
        let mut conn = pool.get().unwrap();
        let last = db::max_tx_pk(&conn).unwrap();
        store_batch(&mut conn, ctx, blocks, last).unwrap().last_tx_pk
    }

    pub fn page(pool: &SqlitePool, source: Source) -> Vec<TxRecord> {
        source.fetch(&pool.get().unwrap(), 1, 10_000).unwrap()
    }

    /// Runs `handler` over everything currently stored, committing in one flush.
    pub fn apply<H: Handler>(pool: &SqlitePool, handler: &mut H) {
        let mut records = Vec::new();
        let txs = page(pool, H::SOURCE);
        for tx in &txs {
            handler.process(tx, &mut records);
        }
        let mut conn = pool.get().unwrap();
        let db = db::write_transaction(&mut conn).unwrap();
        handler.commit(&db, records).unwrap();
        if let Some(last) = txs.last() {
            db::set_counter(&db, H::CURSOR, last.id).unwrap();
        }
        db.commit().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::db::test_pool;
    use crate::models::TxType;

    /// Records every committed transaction id.
    struct Recorder {
        seen: Arc<Mutex<Vec<Id>>>,
    }

    impl Handler for Recorder {
        type Record = Id;

        const NAME: &'static str = "recorder";
        const CURSOR: Counter = Counter::LastAssetTxPk;
        const SOURCE: Source = Source::Transfers;
        const FLUSH_THRESHOLD: usize = 100;

        fn process(&mut self, tx: &TxRecord, records: &mut Vec<Id>) {
            records.push(tx.id);
        }

        fn commit(&mut self, _db: &Transaction<'_>, records: Vec<Id>) -> Result<(), IndexerError> {
            self.seen.lock().unwrap().extend(records);
            Ok(())
        }
    }

    fn record(id: Id) -> TxRecord {
        TxRecord {
            id,
            txid: format!("0x{:064x}", id),
            block_index: id,
            block_time: 1_500_000_000 + id,
            tx_type: TxType::Contract,
            script: None,
            spent: Vec::new(),
            created: Vec::new(),
        }
    }

    fn recorder_pipeline(pool: &SqlitePool) -> (Pipeline<Recorder>, Arc<Mutex<Vec<Id>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let signals = SyncSignals::new();
        let pipeline = Pipeline::new(pool.clone(), Recorder { seen: seen.clone() }, &signals);
        (pipeline, seen)
    }

    fn cursor(pool: &SqlitePool) -> Id {
        db::get_counter(&pool.get().unwrap(), Counter::LastAssetTxPk).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_after_two_idle_seconds() {
        let (_dir, pool) = test_pool();
        let (mut pipeline, seen) = recorder_pipeline(&pool);
        let mut committed = pipeline.subscribe();
        let (tx, rx) = mpsc::channel(16);

        let handle = tokio::spawn(async move { pipeline.handle_stage(rx, 0).await });
        for id in 1..=3 {
            tx.send(record(id)).await.unwrap();
        }

        sleep(Duration::from_millis(1900)).await;
        assert_eq!(cursor(&pool), 0);
        assert!(seen.lock().unwrap().is_empty());

        committed.changed().await.unwrap();
        assert_eq!(*committed.borrow(), 3);
        assert_eq!(cursor(&pool), 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

        drop(tx);
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn each_new_item_restarts_the_idle_timer() {
        let (_dir, pool) = test_pool();
        let (mut pipeline, _seen) = recorder_pipeline(&pool);
        let (tx, rx) = mpsc::channel(16);
        let _handle = tokio::spawn(async move { pipeline.handle_stage(rx, 0).await });

        for id in 1..=3 {
            tx.send(record(id)).await.unwrap();
            sleep(Duration::from_millis(1500)).await;
        }
        // 4.5 s have passed but never 2 s without an item.
        assert_eq!(cursor(&pool), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_immediately_at_the_threshold() {
        let (_dir, pool) = test_pool();
        let (mut pipeline, seen) = recorder_pipeline(&pool);
        let mut committed = pipeline.subscribe();
        let (tx, rx) = mpsc::channel(256);
        let _handle = tokio::spawn(async move { pipeline.handle_stage(rx, 0).await });

        let start = Instant::now();
        for id in 1..=100 {
            tx.send(record(id)).await.unwrap();
        }
        committed.changed().await.unwrap();

        assert!(start.elapsed() < IDLE_FLUSH);
        assert_eq!(cursor(&pool), 100);
        assert_eq!(seen.lock().unwrap().len(), 100);
    }

    #[tokio::test]
    async fn fetch_stage_streams_stored_transactions_in_order() {
        use crate::sync::ingest::fixtures::*;

        let (_dir, pool) = test_pool();
        let ctx = context();
        fixtures::store(
            &pool,
            &ctx,
            &[
                block_with(0, vec![raw_tx("0xa", "MinerTransaction", &[], &[("AX", GAS, "1")])]),
                block_with(1, vec![raw_tx("0xb", "ContractTransaction", &[("0xa", 0)], &[("AY", GAS, "1")])]),
            ],
        );

        let (tx, mut rx) = mpsc::channel(16);
        let fetch = tokio::spawn(fetch_stage(pool.clone(), "test", Source::Transfers, 1, 0, tx));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(second.spent.len(), 1);
        assert_eq!(second.created.len(), 1);

        drop(rx);
        fetch.abort();
    }

    #[test]
    fn each_source_measures_against_its_own_transactions() {
        use crate::sync::ingest::fixtures::*;

        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        assert_eq!(Source::Transfers.ceiling(&conn).unwrap(), 0);
        assert_eq!(Source::Invocations.ceiling(&conn).unwrap(), 0);

        fixtures::store(
            &pool,
            &context(),
            &[block_with(
                0,
                vec![
                    raw_tx("0xa", "InvocationTransaction", &[], &[]),
                    raw_tx("0xb", "MinerTransaction", &[], &[("AX", GAS, "1")]),
                    raw_tx("0xc", "MinerTransaction", &[], &[]),
                ],
            )],
        );
        assert_eq!(db::max_tx_pk(&conn).unwrap(), 3);
        assert_eq!(Source::Transfers.ceiling(&conn).unwrap(), 2);
        assert_eq!(Source::Invocations.ceiling(&conn).unwrap(), 1);
    }

    #[tokio::test]
    async fn reaching_the_last_transfer_finishes_progress() {
        use crate::sync::ingest::fixtures::*;

        let (_dir, pool) = test_pool();
        fixtures::store(
            &pool,
            &context(),
            &[block_with(
                0,
                vec![
                    raw_tx("0xa", "MinerTransaction", &[], &[("AX", GAS, "1")]),
                    raw_tx("0xb", "InvocationTransaction", &[], &[]),
                ],
            )],
        );

        let signals = SyncSignals::new();
        signals.blocks_synced().store(true, std::sync::atomic::Ordering::Release);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new(pool.clone(), Recorder { seen }, &signals);

        let mut batch = Batch {
            records: vec![1],
            cursor: 1,
            pending: true,
        };
        pipeline.flush(&mut batch).await.unwrap();
        assert_eq!(pipeline.progress.percentage(), 100.0);
        assert!(pipeline.progress.is_finished());
    }
}
