use log::debug;
use rusqlite::{Connection, named_params};

use super::error::{DbError, DbResult};

/// Durable progress markers. Each one is only ever written inside the transaction that
/// commits the work it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    LastBlockIndex,
    LastTxPk,
    LastAssetTxPk,
    LastTxPkGasBalance,
    LastTxPkNep5,
    LastTxPkForSc,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::LastBlockIndex => "last_block_index",
            Counter::LastTxPk => "last_tx_pk",
            Counter::LastAssetTxPk => "last_asset_tx_pk",
            Counter::LastTxPkGasBalance => "last_tx_pk_gas_balance",
            Counter::LastTxPkNep5 => "last_tx_pk_nep5",
            Counter::LastTxPkForSc => "last_tx_pk_for_sc",
        }
    }
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn get_counter(conn: &Connection, counter: Counter) -> DbResult<i64> {
    let mut stmt = conn.prepare_cached("SELECT value FROM counter WHERE name = :name")?;
    stmt.query_row(named_params! { ":name": counter.as_str() }, |row| row.get(0))
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::Missing(format!("counter {}", counter)),
            e => e.into(),
        })
}

pub fn set_counter(conn: &Connection, counter: Counter, value: i64) -> DbResult<()> {
    debug!(counter = counter.as_str(), value = value; "DB: Advancing counter");

    conn.execute(
        r#"
        INSERT INTO counter (name, value) VALUES (:name, :value)
        ON CONFLICT(name) DO UPDATE SET value = excluded.value
        "#,
        named_params! {
            ":name": counter.as_str(),
            ":value": value,
        },
    )?;
    Ok(())
}
