use bigdecimal::BigDecimal;
use log::debug;
use rusqlite::{Connection, OptionalExtension, named_params};

use super::chain::parse_decimal;
use super::error::DbResult;
use crate::models::{AssetId, Height};
use crate::rpc::types::RawAsset;

pub fn insert_registry_entries(conn: &Connection, entries: &[(AssetId, String)]) -> DbResult<()> {
    if entries.is_empty() {
        return Ok(());
    }
    debug!(count = entries.len(); "DB: Persisting asset ids");

    let mut stmt =
        conn.prepare_cached("INSERT OR IGNORE INTO asset_registry (id, external_id) VALUES (:id, :external_id)")?;
    for (id, external) in entries {
        stmt.execute(named_params! { ":id": id, ":external_id": external })?;
    }
    Ok(())
}

pub fn load_registry(conn: &Connection) -> DbResult<Vec<(AssetId, String)>> {
    let mut stmt = conn.prepare_cached("SELECT id, external_id FROM asset_registry ORDER BY id")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Records an asset defined by a RegisterTransaction.
pub fn insert_asset(
    conn: &Connection,
    asset_id: AssetId,
    block_index: Height,
    block_time: i64,
    version: i64,
    asset: &RawAsset,
) -> DbResult<()> {
    let name = asset.display_name();
    debug!(asset_id = asset_id, name = &*name; "DB: Inserting asset");

    conn.execute(
        r#"
        INSERT INTO asset (
            asset_id, block_index, time, version, type, name, amount, precision,
            owner, admin, issuer, expiration
        ) VALUES (
            :asset_id, :block_index, :time, :version, :type, :name, :amount, :precision,
            :owner, :admin, :admin, 4000000
        )
        "#,
        named_params! {
            ":asset_id": asset_id,
            ":block_index": block_index,
            ":time": block_time,
            ":version": version,
            ":type": asset.asset_type,
            ":name": name,
            ":amount": asset.amount.to_string(),
            ":precision": asset.precision,
            ":owner": asset.owner,
            ":admin": asset.admin,
        },
    )?;
    Ok(())
}

pub fn increment_asset_addresses(conn: &Connection, asset_id: AssetId, by: i64) -> DbResult<()> {
    conn.prepare_cached("UPDATE asset SET addresses = addresses + :by WHERE asset_id = :asset_id")?
        .execute(named_params! { ":by": by, ":asset_id": asset_id })?;
    Ok(())
}

pub fn increment_asset_transactions(conn: &Connection, asset_id: AssetId, by: i64) -> DbResult<()> {
    conn.prepare_cached("UPDATE asset SET transactions = transactions + :by WHERE asset_id = :asset_id")?
        .execute(named_params! { ":by": by, ":asset_id": asset_id })?;
    Ok(())
}

pub fn get_asset_available(conn: &Connection, asset_id: AssetId) -> DbResult<Option<BigDecimal>> {
    let value: Option<String> = conn
        .prepare_cached("SELECT available FROM asset WHERE asset_id = :asset_id")?
        .query_row(named_params! { ":asset_id": asset_id }, |row| row.get(0))
        .optional()?;
    value.as_deref().map(parse_decimal).transpose()
}

/// Adds `amount` to the circulating supply of a registered asset. Unknown assets are skipped.
pub fn add_asset_available(conn: &Connection, asset_id: AssetId, amount: &BigDecimal) -> DbResult<()> {
    let Some(current) = get_asset_available(conn, asset_id)? else {
        return Ok(());
    };
    let updated = current + amount;
    conn.prepare_cached("UPDATE asset SET available = :available WHERE asset_id = :asset_id")?
        .execute(named_params! { ":available": updated.to_string(), ":asset_id": asset_id })?;
    Ok(())
}
