//! Long-running indexer process.
//!
//! The [`Daemon`] rehydrates in-memory state from storage and then supervises every task
//! until Ctrl+C is pressed or one of them fails:
//!
//! 1. **Endpoint pool**: polls every configured node for its height
//! 2. **Fetch workers**: download blocks into the shared buffer
//! 3. **Arranger**: forwards buffered blocks in height order
//! 4. **Persister**: stores blocks and applies their balance effects
//! 5. **Pipelines**: derive auxiliary tables from stored transactions
//! 6. **Status ticker**: periodic one-line summaries
//!
//! Fetch workers retire once the tip is reached; they run under their own supervisor that
//! only returns when none is left. No other task is expected to return. The first one that
//! does, successfully or not, stops the process and all state is recovered from the last
//! committed counters on the next start.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use log::{error, info};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::cache::{AddressRegistry, AssetRegistry, BalanceCache};
use crate::config::IndexerConfig;
use crate::db::{self, Counter, DbError, SqlitePool};
use crate::error::IndexerError;
use crate::models::{AccountBalanceRow, AccountRow, AssetId, Height, Id};
use crate::pipelines::{
    AssetTxIndex,
    GasDailyBalance,
    Handler,
    Nep5Transfers,
    Pipeline,
    SmartContracts,
    TxEffects,
};
use crate::progress::SyncSignals;
use crate::rpc::{EndpointPool, HttpClient, NodeClient};
use crate::script::{AvmDecoder, ScriptDecoder};
use crate::sync::persister::FLUSH_BLOCKS;
use crate::sync::{Arranger, BlockBuffer, FetchWorkers, IngestContext, Persister};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

type Tasks = JoinSet<Result<(), IndexerError>>;

/// Everything read from storage before any task starts.
#[derive(Debug)]
struct Snapshot {
    accounts: Vec<AccountRow>,
    balances: Vec<AccountBalanceRow>,
    registry: Vec<(AssetId, String)>,
    stored_height: Height,
    last_tx_pk: Id,
}

fn load_snapshot(pool: &SqlitePool) -> Result<Snapshot, DbError> {
    let conn = pool.get()?;
    Ok(Snapshot {
        accounts: db::load_accounts(&conn)?,
        balances: db::load_account_balances(&conn)?,
        registry: db::load_registry(&conn)?,
        stored_height: db::get_counter(&conn, Counter::LastBlockIndex)?,
        last_tx_pk: db::max_tx_pk(&conn)?,
    })
}

/// Fills the shared caches from `snapshot` and returns the context the writers share.
fn rehydrate(snapshot: Snapshot) -> Result<IngestContext, IndexerError> {
    let ctx = IngestContext {
        cache: Arc::new(BalanceCache::new()),
        assets: Arc::new(AssetRegistry::new()),
        addresses: Arc::new(AddressRegistry::new()),
    };
    ctx.assets.load(snapshot.registry);
    ctx.addresses
        .load(snapshot.accounts.iter().map(|a| (a.id, a.address.clone())));
    ctx.cache.load(snapshot.accounts, snapshot.balances)?;
    Ok(ctx)
}

/// Committed cursor of one pipeline, as seen by the status ticker.
struct PipelineStatus {
    name: &'static str,
    cursor: watch::Receiver<Id>,
}

fn spawn_pipeline<H: Handler>(tasks: &mut Tasks, pipeline: Pipeline<H>) -> PipelineStatus {
    let status = PipelineStatus {
        name: H::NAME,
        cursor: pipeline.subscribe(),
    };
    tasks.spawn(pipeline.run());
    status
}

pub struct Daemon {
    config: IndexerConfig,
}

impl Daemon {
    pub fn new(config: IndexerConfig) -> Self {
        Self { config }
    }

    /// Runs the indexer until a shutdown signal is received.
    ///
    /// # Errors
    ///
    /// Returns the error of the first task that fails. A task that returns `Ok` is reported
    /// as [`IndexerError::Fatal`] as well, since none of them is supposed to finish.
    pub async fn run(&self) -> Result<(), IndexerError> {
        let label = self.config.label.as_str();
        info!(label = label, workers = self.config.workers; "Indexer starting. Press Ctrl+C to stop.");

        let pool = db::init_db(&self.config.database_path)?;
        let snapshot = {
            let pool = pool.clone();
            tokio::task::spawn_blocking(move || load_snapshot(&pool)).await??
        };
        let stored_height = snapshot.stored_height;
        let last_tx_pk = snapshot.last_tx_pk;
        let ctx = rehydrate(snapshot)?;
        info!(
            label = label,
            stored_height = stored_height,
            last_tx_pk = last_tx_pk,
            accounts = ctx.cache.len(),
            assets = ctx.assets.len();
            "State restored"
        );

        let http = Arc::new(HttpClient::with_config(self.config.rpc_max_retries, self.config.rpc_timeout())?);
        let endpoints = Arc::new(EndpointPool::new(self.config.endpoints()?, http.clone()));
        let best_height = endpoints.refresh().await;
        endpoints.log_status();
        info!(label = label, best_height = best_height; "Endpoint heights loaded");

        let client = Arc::new(NodeClient::new(endpoints.clone(), http));
        let signals = Arc::new(SyncSignals::new());
        let buffer = Arc::new(BlockBuffer::new(stored_height));
        let mut tasks = Tasks::new();

        let refresher = endpoints.clone();
        tasks.spawn(async move {
            refresher.run().await;
            Ok(())
        });

        let workers = FetchWorkers::new(buffer.clone(), client.clone());
        tasks.spawn(workers.clone().run(self.config.workers));

        let (block_tx, block_rx) = mpsc::channel(FLUSH_BLOCKS * 2);
        tasks.spawn(Arranger::new(buffer.clone(), client, stored_height).run(block_tx));
        tasks.spawn(
            Persister::new(
                pool.clone(),
                ctx.clone(),
                buffer.clone(),
                endpoints.clone(),
                signals.clone(),
                last_tx_pk,
            )
            .run(block_rx),
        );

        let decoder: Arc<dyn ScriptDecoder> = Arc::new(AvmDecoder);
        let pipelines = vec![
            spawn_pipeline(
                &mut tasks,
                Pipeline::new(pool.clone(), TxEffects::new(ctx.cache.clone(), ctx.assets.clone()), &signals),
            ),
            spawn_pipeline(&mut tasks, Pipeline::new(pool.clone(), AssetTxIndex, &signals)),
            spawn_pipeline(
                &mut tasks,
                Pipeline::new(pool.clone(), GasDailyBalance::new(ctx.assets.clone()), &signals),
            ),
            spawn_pipeline(
                &mut tasks,
                Pipeline::new(pool.clone(), Nep5Transfers::new(ctx.clone(), decoder.clone()), &signals),
            ),
            spawn_pipeline(&mut tasks, Pipeline::new(pool, SmartContracts::new(decoder), &signals)),
        ];

        let status = StatusTicker {
            label: self.config.label.clone(),
            buffer,
            endpoints,
            workers,
            ctx,
            pipelines,
        };
        tasks.spawn(status.run());

        let outcome = tokio::select! {
            res = signal::ctrl_c() => {
                res.map_err(|e| IndexerError::Fatal(anyhow!("Failed to listen for ctrl_c: {}", e)))?;
                info!("Received shutdown signal, stopping all tasks...");
                Ok(())
            }
            joined = tasks.join_next() => match joined {
                Some(Ok(Err(e))) => Err(e),
                Some(Err(e)) => Err(e.into()),
                Some(Ok(Ok(()))) | None => Err(IndexerError::Fatal(anyhow!("A task stopped unexpectedly"))),
            },
        };

        tasks.shutdown().await;
        match &outcome {
            Ok(()) => info!("Indexer stopped gracefully."),
            Err(e) => error!(error:% = e; "Indexer stopped"),
        }
        outcome
    }
}

struct StatusTicker {
    label: String,
    buffer: Arc<BlockBuffer>,
    endpoints: Arc<EndpointPool>,
    workers: FetchWorkers,
    ctx: IngestContext,
    pipelines: Vec<PipelineStatus>,
}

impl StatusTicker {
    async fn run(self) -> Result<(), IndexerError> {
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        loop {
            interval.tick().await;
            self.log();
        }
    }

    fn log(&self) {
        let label = self.label.as_str();
        info!(
            label = label,
            buffered = self.buffer.size(),
            highest_height = self.buffer.highest_height(),
            best_height = self.endpoints.best_height(),
            workers = self.workers.live(),
            accounts = self.ctx.cache.len(),
            assets = self.ctx.assets.len(),
            addresses = self.ctx.addresses.len();
            "Status"
        );
        for pipeline in &self.pipelines {
            info!(label = label, pipeline = pipeline.name, cursor = *pipeline.cursor.borrow(); "Pipeline status");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::db::test_pool;
    use crate::models::NEO_ASSET;
    use crate::pipelines::fixtures::store;
    use crate::sync::ingest::fixtures::*;

    #[test]
    fn fresh_database_starts_before_genesis() {
        let (_dir, pool) = test_pool();
        let snapshot = load_snapshot(&pool).unwrap();
        assert_eq!(snapshot.stored_height, -1);
        assert_eq!(snapshot.last_tx_pk, 0);

        let ctx = rehydrate(snapshot).unwrap();
        assert!(ctx.cache.is_empty());
        assert!(ctx.assets.is_empty());
    }

    #[test]
    fn rehydrates_what_the_persister_stored() {
        let (_dir, pool) = test_pool();
        let original = context();
        store(
            &pool,
            &original,
            &[
                block_with(0, vec![raw_tx("0xa", "MinerTransaction", &[], &[("AX", GAS, "10")])]),
                block_with(
                    1,
                    vec![raw_tx("0xb", "ContractTransaction", &[("0xa", 0)], &[("AY", GAS, "10")])],
                ),
            ],
        );

        let snapshot = load_snapshot(&pool).unwrap();
        assert_eq!(snapshot.stored_height, 1);
        assert_eq!(snapshot.last_tx_pk, 2);

        let ctx = rehydrate(snapshot).unwrap();
        let gas = original.assets.get(GAS).unwrap();
        assert_eq!(ctx.assets.get(GAS), Some(gas));
        assert_eq!(ctx.assets.get(NEO_ASSET), None);
        for address in ["AX", "AY"] {
            let id = original.addresses.get(address).unwrap();
            assert_eq!(ctx.addresses.get(address), Some(id));
            assert_eq!(
                ctx.cache.balance(id, gas).map(|b| b.balance),
                original.cache.balance(id, gas).map(|b| b.balance)
            );
        }

        // Ids handed out after a restart continue after the stored ones.
        let next = ctx.addresses.resolve("AZ");
        assert!(next > original.addresses.get("AY").unwrap());
    }

    /// A node at height `tip` that answers "unknown block" above it.
    async fn node_at(tip: Height) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "getblockcount"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": tip + 1})))
            .mount(&server)
            .await;
        for h in 0..=tip {
            Mock::given(method("POST"))
                .and(body_partial_json(json!({"method": "getblock", "params": [h, 1]})))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "hash": format!("0x{:064x}", h),
                        "size": 10,
                        "version": 0,
                        "previousblockhash": "0x00",
                        "merkleroot": "0x00",
                        "time": 1_500_000_000 + h,
                        "index": h,
                        "nonce": "00",
                        "nextconsensus": "A",
                        "tx": []
                    }
                })))
                .mount(&server)
                .await;
        }
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "getblock"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -100, "message": "Unknown block"}
            })))
            .with_priority(10)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn keeps_running_after_workers_retire_at_the_tip() {
        let server = node_at(5).await;
        let dir = tempfile::tempdir().unwrap();
        let config = IndexerConfig {
            label: "test".to_string(),
            rpc_urls: vec![server.uri()],
            workers: 3,
            database_path: dir.path().join("indexer.db"),
            rpc_timeout_secs: 5,
            rpc_max_retries: 0,
        };

        let daemon = Daemon::new(config.clone());
        let outcome = tokio::time::timeout(Duration::from_secs(3), daemon.run()).await;
        assert!(outcome.is_err(), "daemon stopped: {:?}", outcome);

        let pool = db::init_db(&config.database_path).unwrap();
        let conn = pool.get().unwrap();
        assert_eq!(db::get_counter(&conn, Counter::LastBlockIndex).unwrap(), 5);
    }
}
