use std::collections::BTreeMap;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use log::debug;
use rusqlite::{Connection, OptionalExtension, named_params};

use super::error::{DbError, DbResult};
use crate::models::{Id, StoredOutput, TxType};
use crate::rpc::RawBlock;
use crate::rpc::types::RawTx;

pub fn insert_block(conn: &Connection, block: &RawBlock) -> DbResult<()> {
    debug!(height = block.index, txs = block.tx.len(); "DB: Inserting block");

    conn.execute(
        r#"
        INSERT INTO block (
            id, hash, size, version, previous_block_hash, merkle_root, time,
            nonce, next_consensus, script_invocation, script_verification, txs
        ) VALUES (
            :id, :hash, :size, :version, :previous_block_hash, :merkle_root, :time,
            :nonce, :next_consensus, :script_invocation, :script_verification, :txs
        )
        "#,
        named_params! {
            ":id": block.index,
            ":hash": block.hash,
            ":size": block.size,
            ":version": block.version,
            ":previous_block_hash": block.previous_block_hash,
            ":merkle_root": block.merkle_root,
            ":time": block.time,
            ":nonce": block.nonce,
            ":next_consensus": block.next_consensus,
            ":script_invocation": block.script.invocation,
            ":script_verification": block.script.verification,
            ":txs": block.tx.len() as i64,
        },
    )?;
    Ok(())
}

/// Inserts a transaction row together with its attributes, witnesses and claims.
pub fn insert_tx(conn: &Connection, id: Id, block: &RawBlock, tx: &RawTx) -> DbResult<()> {
    conn.execute(
        r#"
        INSERT INTO tx (
            id, block_index, block_time, txid, size, type, version,
            sys_fee, net_fee, nonce, script, gas
        ) VALUES (
            :id, :block_index, :block_time, :txid, :size, :type, :version,
            :sys_fee, :net_fee, :nonce, :script, :gas
        )
        "#,
        named_params! {
            ":id": id,
            ":block_index": block.index,
            ":block_time": block.time,
            ":txid": tx.txid,
            ":size": tx.size,
            ":type": tx.tx_type,
            ":version": tx.version,
            ":sys_fee": tx.sys_fee.to_string(),
            ":net_fee": tx.net_fee.to_string(),
            ":nonce": tx.nonce,
            ":script": tx.script,
            ":gas": tx.gas.as_ref().map(|g| g.to_string()),
        },
    )?;

    let mut attr = conn.prepare_cached("INSERT INTO tx_attr (tx_id, usage, data) VALUES (:tx_id, :usage, :data)")?;
    for a in &tx.attributes {
        attr.execute(named_params! { ":tx_id": id, ":usage": a.usage, ":data": a.data })?;
    }

    let mut script = conn.prepare_cached(
        "INSERT INTO tx_scripts (tx_id, invocation, verification) VALUES (:tx_id, :invocation, :verification)",
    )?;
    for w in &tx.scripts {
        script.execute(named_params! {
            ":tx_id": id,
            ":invocation": w.invocation,
            ":verification": w.verification,
        })?;
    }

    let mut claim = conn.prepare_cached(
        "INSERT INTO tx_claims (tx_id, claimed_txid, claimed_n) VALUES (:tx_id, :claimed_txid, :claimed_n)",
    )?;
    for c in &tx.claims {
        claim.execute(named_params! { ":tx_id": id, ":claimed_txid": c.txid, ":claimed_n": c.vout })?;
    }
    Ok(())
}

pub fn insert_input(conn: &Connection, tx_id: Id, n: u32, spent_tx_id: Id, spent_n: u32) -> DbResult<()> {
    conn.prepare_cached(
        r#"
        INSERT INTO tx_vin (tx_id, n, spent_tx_id, spent_n)
        VALUES (:tx_id, :n, :spent_tx_id, :spent_n)
        "#,
    )?
    .execute(named_params! {
        ":tx_id": tx_id,
        ":n": n,
        ":spent_tx_id": spent_tx_id,
        ":spent_n": spent_n,
    })?;
    Ok(())
}

/// Inserts an output and its unspent-output row.
pub fn insert_output(conn: &Connection, output: &StoredOutput) -> DbResult<()> {
    let value = output.value.to_string();
    let params = named_params! {
        ":tx_id": output.tx_id,
        ":n": output.n,
        ":address_id": output.address_id,
        ":asset_id": output.asset_id,
        ":value": value,
    };
    conn.prepare_cached(
        r#"
        INSERT INTO tx_vout (tx_id, n, address_id, asset_id, value)
        VALUES (:tx_id, :n, :address_id, :asset_id, :value)
        "#,
    )?
    .execute(params)?;
    conn.prepare_cached(
        r#"
        INSERT INTO utxo (tx_id, n, address_id, asset_id, value)
        VALUES (:tx_id, :n, :address_id, :asset_id, :value)
        "#,
    )?
    .execute(params)?;
    Ok(())
}

pub fn mark_output_spent(conn: &Connection, tx_id: Id, n: u32, spent_by: Id) -> DbResult<()> {
    conn.prepare_cached("UPDATE utxo SET used_in_tx = :spent_by WHERE tx_id = :tx_id AND n = :n")?
        .execute(named_params! { ":spent_by": spent_by, ":tx_id": tx_id, ":n": n })?;
    Ok(())
}

pub fn find_tx_pk(conn: &Connection, txid: &str) -> DbResult<Option<Id>> {
    let mut stmt = conn.prepare_cached("SELECT id FROM tx WHERE txid = :txid")?;
    Ok(stmt
        .query_row(named_params! { ":txid": txid }, |row| row.get(0))
        .optional()?)
}

pub fn get_output(conn: &Connection, tx_id: Id, n: u32) -> DbResult<Option<StoredOutput>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT address_id, asset_id, value
        FROM tx_vout
        WHERE tx_id = :tx_id AND n = :n
        "#,
    )?;
    let row = stmt
        .query_row(named_params! { ":tx_id": tx_id, ":n": n }, |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
        })
        .optional()?;

    row.map(|(address_id, asset_id, value)| {
        Ok(StoredOutput {
            tx_id,
            n,
            address_id,
            asset_id,
            value: parse_decimal(&value)?,
        })
    })
    .transpose()
}

pub fn max_tx_pk(conn: &Connection) -> DbResult<Id> {
    Ok(conn.query_row("SELECT COALESCE(MAX(id), 0) FROM tx", [], |row| row.get(0))?)
}

pub fn bump_tx_type_counters(conn: &Connection, counts: &BTreeMap<TxType, i64>) -> DbResult<()> {
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO tx_type_counter (type, count) VALUES (:type, :count)
        ON CONFLICT(type) DO UPDATE SET count = count + excluded.count
        "#,
    )?;
    for (tx_type, count) in counts {
        stmt.execute(named_params! { ":type": tx_type.to_string(), ":count": count })?;
    }
    Ok(())
}

pub fn tx_type_count(conn: &Connection, tx_type: TxType) -> DbResult<i64> {
    Ok(conn
        .query_row(
            "SELECT count FROM tx_type_counter WHERE type = :type",
            named_params! { ":type": tx_type.to_string() },
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0))
}

pub(crate) fn parse_decimal(value: &str) -> DbResult<BigDecimal> {
    BigDecimal::from_str(value).map_err(|e| DbError::Decoding(format!("'{}' is not a decimal: {}", value, e)))
}
