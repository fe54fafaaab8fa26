//! Turns a batch of arranged blocks into rows, inside one database transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::anyhow;
use log::debug;
use rusqlite::Connection;

use crate::cache::{AddressRegistry, AssetRegistry, BalanceCache, EffectId};
use crate::db::{self, Counter, DbError};
use crate::error::IndexerError;
use crate::models::{AddressId, AssetId, Height, Id, StoredOutput, TxType};
use crate::rpc::RawBlock;
use crate::rpc::types::RawTx;

/// Shared state the persister writes through.
#[derive(Clone)]
pub struct IngestContext {
    pub cache: Arc<BalanceCache>,
    pub assets: Arc<AssetRegistry>,
    pub addresses: Arc<AddressRegistry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub last_height: Height,
    pub last_tx_pk: Id,
    pub txs: usize,
}

/// Stores `blocks` (consecutive, ascending) and applies their balance effects.
///
/// `last_tx_pk` is the largest transaction pk already stored; new transactions continue
/// from there. Everything, including the `last_block_index` counter and any newly
/// assigned asset ids, commits atomically.
pub fn store_batch(
    conn: &mut Connection,
    ctx: &IngestContext,
    blocks: &[RawBlock],
    last_tx_pk: Id,
) -> Result<BatchSummary, IndexerError> {
    let Some(last_height) = blocks.last().map(|b| b.index) else {
        return Err(IndexerError::Fatal(anyhow!("Empty block batch")));
    };
    let db = db::write_transaction(conn)?;

    create_addresses(&db, ctx, blocks)?;

    let mut tx_pks: HashMap<&str, Id> = HashMap::new();
    let mut type_counts: BTreeMap<TxType, i64> = BTreeMap::new();
    let mut pk = last_tx_pk;

    for block in blocks {
        db::insert_block(&db, block)?;
        for raw in &block.tx {
            let tx_type = raw.tx_type.parse::<TxType>().map_err(|e| {
                IndexerError::Fatal(anyhow!("{} in tx {} at height {}", e, raw.txid, block.index))
            })?;
            pk += 1;
            tx_pks.insert(raw.txid.as_str(), pk);
            db::insert_tx(&db, pk, block, raw)?;
            *type_counts.entry(tx_type).or_insert(0) += 1;

            if let (TxType::Register, Some(asset)) = (tx_type, &raw.asset) {
                let asset_id = ctx.assets.resolve(&raw.txid);
                db::insert_asset(&db, asset_id, block.index, block.time, raw.version, asset)?;
            }

            apply_inputs(&db, ctx, block, pk, raw, &tx_pks)?;
            apply_outputs(&db, ctx, block, pk, raw)?;
        }
    }

    db::bump_tx_type_counters(&db, &type_counts)?;
    db::insert_registry_entries(&db, &ctx.assets.take_unpersisted())?;
    db::set_counter(&db, Counter::LastBlockIndex, last_height)?;
    db.commit().map_err(DbError::from)?;

    debug!(
        last_height = last_height,
        blocks = blocks.len(),
        txs = pk - last_tx_pk;
        "Stored block batch"
    );

    Ok(BatchSummary {
        last_height,
        last_tx_pk: pk,
        txs: (pk - last_tx_pk) as usize,
    })
}

/// Creates every address receiving an output in this batch that was never seen before.
///
/// Addresses are walked in sorted order so concurrent creators take locks in one order.
fn create_addresses(db: &Connection, ctx: &IngestContext, blocks: &[RawBlock]) -> Result<(), IndexerError> {
    let mut first_seen: BTreeMap<&str, i64> = BTreeMap::new();
    for block in blocks {
        for out in block.tx.iter().flat_map(|t| t.vout.iter()) {
            first_seen
                .entry(out.address.as_str())
                .and_modify(|t| *t = (*t).min(block.time))
                .or_insert(block.time);
        }
    }

    for (address, time) in first_seen {
        let id = ctx.addresses.resolve(address);
        ctx.cache.get_or_create(id, time);
        db::insert_address(db, id, address, time)?;
    }
    Ok(())
}

fn apply_inputs(
    db: &Connection,
    ctx: &IngestContext,
    block: &RawBlock,
    tx_id: Id,
    raw: &RawTx,
    tx_pks: &HashMap<&str, Id>,
) -> Result<(), IndexerError> {
    for (i, vin) in raw.vin.iter().enumerate() {
        let n = i as u32;
        let spent_tx = match tx_pks.get(vin.txid.as_str()) {
            Some(pk) => *pk,
            None => db::find_tx_pk(db, &vin.txid)?.ok_or_else(|| {
                IndexerError::Fatal(anyhow!("tx {} spends unknown tx {}", raw.txid, vin.txid))
            })?,
        };
        let spent = db::get_output(db, spent_tx, vin.vout)?.ok_or_else(|| {
            IndexerError::Fatal(anyhow!(
                "tx {} spends missing output {}:{}",
                raw.txid,
                vin.txid,
                vin.vout
            ))
        })?;

        db::insert_input(db, tx_id, n, spent_tx, vin.vout)?;
        db::mark_output_spent(db, spent_tx, vin.vout, tx_id)?;

        let applied = ctx.cache.subtract_balance(
            spent.address_id,
            spent.asset_id,
            &spent.value,
            block.index,
            EffectId::vin(tx_id, n),
        )?;
        if applied {
            mirror_balance(db, ctx, spent.address_id, spent.asset_id)?;
        }
    }
    Ok(())
}

fn apply_outputs(db: &Connection, ctx: &IngestContext, block: &RawBlock, tx_id: Id, raw: &RawTx) -> Result<(), IndexerError> {
    for out in &raw.vout {
        let asset_id = ctx.assets.resolve(&out.asset);
        let address_id = ctx
            .addresses
            .get(&out.address)
            .ok_or_else(|| IndexerError::Fatal(anyhow!("address {} was not created", out.address)))?;
        let output = StoredOutput {
            tx_id,
            n: out.n,
            address_id,
            asset_id,
            value: out.value.clone(),
        };
        db::insert_output(db, &output)?;

        let effect = EffectId::vout(tx_id, out.n);
        let (_, created) = ctx
            .cache
            .get_or_create_asset(address_id, asset_id, &out.value, block.index, Some(effect))?;
        if created {
            db::insert_addr_asset(db, address_id, asset_id, &out.value, block.time)?;
            db::increment_asset_addresses(db, asset_id, 1)?;
        } else if ctx
            .cache
            .add_balance(address_id, asset_id, &out.value, block.index, effect)?
        {
            mirror_balance(db, ctx, address_id, asset_id)?;
        }
    }
    Ok(())
}

pub(crate) fn mirror_balance(
    db: &Connection,
    ctx: &IngestContext,
    address_id: AddressId,
    asset_id: AssetId,
) -> Result<(), IndexerError> {
    let entry = ctx
        .cache
        .balance(address_id, asset_id)
        .ok_or(crate::cache::CacheError::MissingAsset { address_id, asset_id })?;
    db::set_addr_asset_balance(db, address_id, asset_id, &entry.balance)?;
    Ok(())
}
