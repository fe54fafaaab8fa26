use log::debug;
use rusqlite::{Connection, named_params};

use super::error::DbResult;
use crate::models::{AddressId, AssetId, Id};

/// One row of the address/asset/transaction lookup index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetTxRow {
    pub address_id: AddressId,
    pub asset_id: AssetId,
    pub tx_id: Id,
}

pub fn insert_asset_tx(conn: &Connection, rows: &[AssetTxRow]) -> DbResult<()> {
    debug!(count = rows.len(); "DB: Inserting address-asset index rows");

    let mut stmt = conn.prepare_cached(
        r#"
        INSERT OR IGNORE INTO asset_tx (address_id, asset_id, tx_id)
        VALUES (:address_id, :asset_id, :tx_id)
        "#,
    )?;
    for row in rows {
        stmt.execute(named_params! {
            ":address_id": row.address_id,
            ":asset_id": row.asset_id,
            ":tx_id": row.tx_id,
        })?;
    }
    Ok(())
}
