//! SQLite persistence.
//!
//! Every function here takes a plain `&Connection` so it can run either on a pooled
//! connection or inside a `rusqlite::Transaction`. Async callers wrap them in
//! `tokio::task::spawn_blocking`.

use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use rusqlite_migration::{M, Migrations};

use crate::error::IndexerError;

mod error;
pub use error::{DbError, DbResult};

mod counters;
pub use counters::{Counter, get_counter, set_counter};

mod chain;
pub use chain::{
    bump_tx_type_counters,
    find_tx_pk,
    get_output,
    insert_block,
    insert_input,
    insert_output,
    insert_tx,
    mark_output_spent,
    max_tx_pk,
    tx_type_count,
};

mod assets;
pub use assets::{
    add_asset_available,
    get_asset_available,
    increment_asset_addresses,
    increment_asset_transactions,
    insert_asset,
    insert_registry_entries,
    load_registry,
};

mod accounts;
pub use accounts::{
    AddressTxKind,
    get_addr_asset_balance,
    insert_addr_asset,
    insert_addr_tx,
    insert_address,
    increment_address_transactions,
    load_account_balances,
    load_accounts,
    set_addr_asset_balance,
    touch_addr_asset,
    update_address_times,
};

mod pipeline_reads;
pub use pipeline_reads::{fetch_invocations, fetch_tx_page, max_invocation_tx_pk, max_transfer_tx_pk};

mod asset_tx;
pub use asset_tx::{AssetTxRow, insert_asset_tx};

mod gas;
pub use gas::{get_latest_gas_balance, upsert_gas_balance};

mod nep5;
pub use nep5::{increment_nep5_counters, insert_nep5_token, insert_nep5_transfer};

mod contracts;
pub use contracts::insert_contract;

pub type SqlitePool = r2d2::Pool<SqliteConnectionManager>;

const READ_RETRY_DELAY: Duration = Duration::from_secs(1);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(include_str!("../../migrations/0001_init.sql"))])
}

/// Opens (creating if needed) the database at `db_path` and brings the schema up to date.
pub fn init_db(db_path: impl AsRef<Path>) -> DbResult<SqlitePool> {
    let path = db_path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        c.pragma_update(None, "synchronous", "NORMAL")?;
        c.busy_timeout(BUSY_TIMEOUT)
    });
    let pool = r2d2::Pool::builder().max_size(8).build(manager)?;

    let mut conn = pool.get()?;
    migrations().to_latest(&mut conn)?;
    info!(path:% = path.display(); "Database ready");

    Ok(pool)
}

/// Starts a write transaction that takes the write lock up front.
///
/// A deferred transaction that reads before writing cannot upgrade once another connection
/// has committed in between, and fails with `SQLITE_BUSY` without honouring the busy
/// timeout. Taking the lock at `BEGIN` makes concurrent writers queue instead.
pub fn write_transaction(conn: &mut Connection) -> DbResult<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

/// Runs a read on a pooled connection, reconnecting and retrying while the database is
/// unreachable or busy. Any other failure is returned.
pub async fn read_with_retry<T, F>(pool: &SqlitePool, what: &'static str, read: F) -> Result<T, IndexerError>
where
    T: Send + 'static,
    F: Fn(&Connection) -> DbResult<T> + Clone + Send + 'static,
{
    loop {
        let pool = pool.clone();
        let read = read.clone();
        let res = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            read(&conn)
        })
        .await?;

        match res {
            Ok(value) => return Ok(value),
            Err(e) if e.is_connection() => {
                let e = IndexerError::Intermittent(e.to_string());
                warn!(query = what, error:% = e; "DB: read failed, retrying");
                tokio::time::sleep(READ_RETRY_DELAY).await;
            },
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_pool() -> (tempfile::TempDir, SqlitePool) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = init_db(temp_dir.path().join("indexer.db")).expect("Failed to init DB");
    (temp_dir, pool)
}
