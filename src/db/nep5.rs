use bigdecimal::BigDecimal;
use log::debug;
use rusqlite::{Connection, named_params};

use super::error::DbResult;
use crate::models::{AddressId, AssetId, Height, Id};

/// Creates the token row the first time a contract is seen transferring.
pub fn insert_nep5_token(
    conn: &Connection,
    asset_id: AssetId,
    script_hash: &str,
    block_index: Height,
    block_time: i64,
) -> DbResult<()> {
    debug!(asset_id = asset_id, script_hash = script_hash; "DB: Registering NEP5 token");

    conn.prepare_cached(
        r#"
        INSERT OR IGNORE INTO nep5 (asset_id, script_hash, block_index, block_time)
        VALUES (:asset_id, :script_hash, :block_index, :block_time)
        "#,
    )?
    .execute(named_params! {
        ":asset_id": asset_id,
        ":script_hash": script_hash,
        ":block_index": block_index,
        ":block_time": block_time,
    })?;
    Ok(())
}

/// Applies deltas to a token's counters.
pub fn increment_nep5_counters(
    conn: &Connection,
    asset_id: AssetId,
    addresses: i64,
    holding_addresses: i64,
    transfers: i64,
) -> DbResult<()> {
    conn.prepare_cached(
        r#"
        UPDATE nep5
        SET addresses = addresses + :addresses,
            holding_addresses = holding_addresses + :holding_addresses,
            transfers = transfers + :transfers
        WHERE asset_id = :asset_id
        "#,
    )?
    .execute(named_params! {
        ":asset_id": asset_id,
        ":addresses": addresses,
        ":holding_addresses": holding_addresses,
        ":transfers": transfers,
    })?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn insert_nep5_transfer(
    conn: &Connection,
    tx_id: Id,
    n: u32,
    asset_id: AssetId,
    from: Option<AddressId>,
    to: AddressId,
    value: &BigDecimal,
    block_index: Height,
    block_time: i64,
) -> DbResult<()> {
    conn.prepare_cached(
        r#"
        INSERT OR IGNORE INTO nep5_tx (
            tx_id, n, asset_id, from_address_id, to_address_id, value, block_index, block_time
        ) VALUES (
            :tx_id, :n, :asset_id, :from, :to, :value, :block_index, :block_time
        )
        "#,
    )?
    .execute(named_params! {
        ":tx_id": tx_id,
        ":n": n,
        ":asset_id": asset_id,
        ":from": from,
        ":to": to,
        ":value": value.to_string(),
        ":block_index": block_index,
        ":block_time": block_time,
    })?;
    Ok(())
}
