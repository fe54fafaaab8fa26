use rusqlite::{Connection, named_params};

use super::chain::parse_decimal;
use super::error::{DbError, DbResult};
use crate::models::{Id, StoredOutput, TxRecord, TxType};

/// Reads up to `limit` transactions with at least one input or output, starting at `from`
/// (inclusive), each joined with the outputs it spends and creates.
pub fn fetch_tx_page(conn: &Connection, from: Id, limit: i64) -> DbResult<Vec<TxRecord>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT id, txid, block_index, block_time, type, script
        FROM tx
        WHERE id >= :from
          AND (EXISTS (SELECT 1 FROM tx_vin WHERE tx_vin.tx_id = tx.id)
               OR EXISTS (SELECT 1 FROM tx_vout WHERE tx_vout.tx_id = tx.id))
        ORDER BY id ASC
        LIMIT :limit
        "#,
    )?;
    let mut txs = read_tx_rows(&mut stmt, from, limit)?;
    for tx in &mut txs {
        tx.spent = spent_outputs(conn, tx.id)?;
        tx.created = created_outputs(conn, tx.id)?;
    }
    Ok(txs)
}

/// Reads up to `limit` invocation transactions starting at `from` (inclusive). Inputs and
/// outputs are not joined.
pub fn fetch_invocations(conn: &Connection, from: Id, limit: i64) -> DbResult<Vec<TxRecord>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT id, txid, block_index, block_time, type, script
        FROM tx
        WHERE id >= :from AND type = 'InvocationTransaction'
        ORDER BY id ASC
        LIMIT :limit
        "#,
    )?;
    read_tx_rows(&mut stmt, from, limit)
}

/// Highest transaction pk [`fetch_tx_page`] can return, or 0.
pub fn max_transfer_tx_pk(conn: &Connection) -> DbResult<Id> {
    Ok(conn.query_row(
        r#"
        SELECT COALESCE(MAX(id), 0)
        FROM tx
        WHERE EXISTS (SELECT 1 FROM tx_vin WHERE tx_vin.tx_id = tx.id)
           OR EXISTS (SELECT 1 FROM tx_vout WHERE tx_vout.tx_id = tx.id)
        "#,
        [],
        |row| row.get(0),
    )?)
}

/// Highest transaction pk [`fetch_invocations`] can return, or 0.
pub fn max_invocation_tx_pk(conn: &Connection) -> DbResult<Id> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(id), 0) FROM tx WHERE type = 'InvocationTransaction'",
        [],
        |row| row.get(0),
    )?)
}

fn read_tx_rows(stmt: &mut rusqlite::CachedStatement<'_>, from: Id, limit: i64) -> DbResult<Vec<TxRecord>> {
    let rows = stmt.query_map(named_params! { ":from": from, ":limit": limit }, |row| {
        Ok((
            row.get::<_, Id>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut txs = Vec::new();
    for row in rows {
        let (id, txid, block_index, block_time, tx_type, script) = row?;
        let tx_type = tx_type.parse::<TxType>().map_err(DbError::Decoding)?;
        txs.push(TxRecord {
            id,
            txid,
            block_index,
            block_time,
            tx_type,
            script,
            spent: Vec::new(),
            created: Vec::new(),
        });
    }
    Ok(txs)
}

fn spent_outputs(conn: &Connection, tx_id: Id) -> DbResult<Vec<StoredOutput>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT o.tx_id, o.n, o.address_id, o.asset_id, o.value
        FROM tx_vin i
        JOIN tx_vout o ON o.tx_id = i.spent_tx_id AND o.n = i.spent_n
        WHERE i.tx_id = :tx_id
        ORDER BY i.n ASC
        "#,
    )?;
    collect_outputs(&mut stmt, tx_id)
}

fn created_outputs(conn: &Connection, tx_id: Id) -> DbResult<Vec<StoredOutput>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT tx_id, n, address_id, asset_id, value
        FROM tx_vout
        WHERE tx_id = :tx_id
        ORDER BY n ASC
        "#,
    )?;
    collect_outputs(&mut stmt, tx_id)
}

fn collect_outputs(stmt: &mut rusqlite::CachedStatement<'_>, tx_id: Id) -> DbResult<Vec<StoredOutput>> {
    let rows = stmt.query_map(named_params! { ":tx_id": tx_id }, |row| {
        Ok((
            row.get::<_, Id>(0)?,
            row.get::<_, u32>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut outputs = Vec::new();
    for row in rows {
        let (tx_id, n, address_id, asset_id, value) = row?;
        outputs.push(StoredOutput {
            tx_id,
            n,
            address_id,
            asset_id,
            value: parse_decimal(&value)?,
        });
    }
    Ok(outputs)
}
