use bigdecimal::BigDecimal;
use log::debug;
use rusqlite::{Connection, OptionalExtension, named_params};
use serde_rusqlite::from_rows;

use super::chain::parse_decimal;
use super::error::DbResult;
use crate::models::{AccountBalanceRow, AccountRow, AddressId, AssetId, Id};

/// Inserts the address row unless it already exists.
///
/// Every stage that references an address calls this in its own transaction, since the
/// stage that first allocated the id may not have committed yet.
pub fn insert_address(conn: &Connection, id: AddressId, address: &str, tx_time: i64) -> DbResult<()> {
    debug!(address_id = id; "DB: Ensuring address");

    conn.prepare_cached(
        r#"
        INSERT INTO address (id, address, created_at, last_transaction_time)
        VALUES (:id, :address, :time, :time)
        ON CONFLICT(id) DO NOTHING
        "#,
    )?
    .execute(named_params! { ":id": id, ":address": address, ":time": tx_time })?;
    Ok(())
}

pub fn update_address_times(conn: &Connection, id: AddressId, created_at: i64, last_transaction_time: i64) -> DbResult<()> {
    conn.prepare_cached(
        r#"
        UPDATE address
        SET created_at = :created_at,
            last_transaction_time = :last_transaction_time
        WHERE id = :id
        "#,
    )?
    .execute(named_params! {
        ":id": id,
        ":created_at": created_at,
        ":last_transaction_time": last_transaction_time,
    })?;
    Ok(())
}

/// Which per-address transaction counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressTxKind {
    Asset,
    Nep5,
}

pub fn increment_address_transactions(conn: &Connection, id: AddressId, kind: AddressTxKind) -> DbResult<()> {
    let sql = match kind {
        AddressTxKind::Asset => "UPDATE address SET trans_asset = trans_asset + 1 WHERE id = :id",
        AddressTxKind::Nep5 => "UPDATE address SET trans_nep5 = trans_nep5 + 1 WHERE id = :id",
    };
    conn.prepare_cached(sql)?.execute(named_params! { ":id": id })?;
    Ok(())
}

pub fn insert_addr_asset(
    conn: &Connection,
    address_id: AddressId,
    asset_id: AssetId,
    balance: &BigDecimal,
    tx_time: i64,
) -> DbResult<()> {
    conn.prepare_cached(
        r#"
        INSERT INTO addr_asset (address_id, asset_id, balance, transactions, last_transaction_time)
        VALUES (:address_id, :asset_id, :balance, 0, :time)
        "#,
    )?
    .execute(named_params! {
        ":address_id": address_id,
        ":asset_id": asset_id,
        ":balance": balance.to_string(),
        ":time": tx_time,
    })?;
    Ok(())
}

/// Mirrors a cached balance into storage.
pub fn set_addr_asset_balance(
    conn: &Connection,
    address_id: AddressId,
    asset_id: AssetId,
    balance: &BigDecimal,
) -> DbResult<()> {
    conn.prepare_cached(
        "UPDATE addr_asset SET balance = :balance WHERE address_id = :address_id AND asset_id = :asset_id",
    )?
    .execute(named_params! {
        ":address_id": address_id,
        ":asset_id": asset_id,
        ":balance": balance.to_string(),
    })?;
    Ok(())
}

pub fn get_addr_asset_balance(conn: &Connection, address_id: AddressId, asset_id: AssetId) -> DbResult<Option<BigDecimal>> {
    let value: Option<String> = conn
        .prepare_cached("SELECT balance FROM addr_asset WHERE address_id = :address_id AND asset_id = :asset_id")?
        .query_row(named_params! { ":address_id": address_id, ":asset_id": asset_id }, |row| {
            row.get(0)
        })
        .optional()?;
    value.as_deref().map(parse_decimal).transpose()
}

/// Counts one more transaction for the pair and moves its last activity time forward.
pub fn touch_addr_asset(conn: &Connection, address_id: AddressId, asset_id: AssetId, tx_time: i64) -> DbResult<()> {
    conn.prepare_cached(
        r#"
        UPDATE addr_asset
        SET transactions = transactions + 1,
            last_transaction_time = MAX(last_transaction_time, :time)
        WHERE address_id = :address_id AND asset_id = :asset_id
        "#,
    )?
    .execute(named_params! { ":address_id": address_id, ":asset_id": asset_id, ":time": tx_time })?;
    Ok(())
}

pub fn insert_addr_tx(
    conn: &Connection,
    tx_id: Id,
    address_id: AddressId,
    block_time: i64,
    kind: AddressTxKind,
) -> DbResult<()> {
    let asset_type = match kind {
        AddressTxKind::Asset => "asset",
        AddressTxKind::Nep5 => "nep5",
    };
    conn.prepare_cached(
        r#"
        INSERT OR IGNORE INTO addr_tx (tx_id, address_id, block_time, asset_type)
        VALUES (:tx_id, :address_id, :block_time, :asset_type)
        "#,
    )?
    .execute(named_params! {
        ":tx_id": tx_id,
        ":address_id": address_id,
        ":block_time": block_time,
        ":asset_type": asset_type,
    })?;
    Ok(())
}

pub fn load_accounts(conn: &Connection) -> DbResult<Vec<AccountRow>> {
    let mut stmt = conn.prepare_cached("SELECT id, address, created_at, last_transaction_time FROM address")?;
    let rows = stmt.query([])?;
    Ok(from_rows::<AccountRow>(rows).collect::<Result<Vec<_>, _>>()?)
}

pub fn load_account_balances(conn: &Connection) -> DbResult<Vec<AccountBalanceRow>> {
    let mut stmt = conn.prepare_cached("SELECT address_id, asset_id, balance FROM addr_asset")?;
    let rows = stmt.query([])?;
    Ok(from_rows::<AccountBalanceRow>(rows).collect::<Result<Vec<_>, _>>()?)
}
