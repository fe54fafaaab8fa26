use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::anyhow;
use bigdecimal::{BigDecimal, Zero};
use log::debug;
use rusqlite::Transaction;

use super::{Handler, Source};
use crate::cache::EffectId;
use crate::db::{self, AddressTxKind, Counter};
use crate::error::IndexerError;
use crate::models::{AddressId, AssetId, Height, Id, Nep5Transfer, TxRecord};
use crate::script::ScriptDecoder;
use crate::sync::IngestContext;
use crate::sync::ingest::mirror_balance;

/// One decoded transfer, positioned in the transaction log.
#[derive(Debug, Clone)]
pub struct Nep5Record {
    pub tx_id: Id,
    pub n: u32,
    pub block_index: Height,
    pub block_time: i64,
    pub transfer: Nep5Transfer,
}

#[derive(Debug, Default)]
struct TokenCounts {
    addresses: i64,
    holders: i64,
    transfers: i64,
}

/// Decodes NEP5 `transfer` calls out of invocation scripts and moves token balances.
///
/// Token asset ids come from the shared asset registry, keyed by contract script hash.
/// Amounts are kept in the token's raw integer units.
pub struct Nep5Transfers {
    ctx: IngestContext,
    decoder: Arc<dyn ScriptDecoder>,
}

impl Nep5Transfers {
    pub fn new(ctx: IngestContext, decoder: Arc<dyn ScriptDecoder>) -> Self {
        Self { ctx, decoder }
    }

    fn decode(&self, tx: &TxRecord) -> Vec<Nep5Transfer> {
        let Some(script) = tx.script.as_deref() else {
            return Vec::new();
        };
        let bytes = match hex::decode(script) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(txid = &*tx.txid, error:% = e; "Invocation script is not hex");
                return Vec::new();
            },
        };
        self.decoder.transfers(&bytes).unwrap_or_else(|e| {
            debug!(txid = &*tx.txid, error:% = e; "Skipping undecodable invocation script");
            Vec::new()
        })
    }

    /// Creates every address first seen in `records`, in sorted order.
    fn create_addresses(&self, db: &Transaction<'_>, records: &[Nep5Record]) -> Result<(), IndexerError> {
        let mut first_seen: BTreeMap<&str, i64> = BTreeMap::new();
        for r in records {
            for address in r.transfer.from.iter().chain(std::iter::once(&r.transfer.to)) {
                first_seen
                    .entry(address.as_str())
                    .and_modify(|t| *t = (*t).min(r.block_time))
                    .or_insert(r.block_time);
            }
        }

        for (address, time) in first_seen {
            let id = self.ctx.addresses.resolve(address);
            self.ctx.cache.get_or_create(id, time);
            db::insert_address(db, id, address, time)?;
        }
        Ok(())
    }

    fn address_id(&self, address: &str) -> Result<AddressId, IndexerError> {
        self.ctx
            .addresses
            .get(address)
            .ok_or_else(|| IndexerError::Fatal(anyhow!("address {} was not created", address)))
    }

    fn debit(
        &self,
        db: &Transaction<'_>,
        r: &Nep5Record,
        from: AddressId,
        asset_id: AssetId,
        counts: &mut TokenCounts,
    ) -> Result<(), IndexerError> {
        let cache = &self.ctx.cache;
        let zero = BigDecimal::zero();
        let (before, created) = cache.get_or_create_asset(from, asset_id, &zero, r.block_index, None)?;
        if created {
            db::insert_addr_asset(db, from, asset_id, &zero, r.block_time)?;
            counts.addresses += 1;
        }

        let effect = EffectId::transfer_debit(r.tx_id, r.n);
        if cache.subtract_balance(from, asset_id, &r.transfer.amount, r.block_index, effect)? {
            mirror_balance(db, &self.ctx, from, asset_id)?;
            let after = cache.balance(from, asset_id).map(|b| b.balance).unwrap_or_default();
            if before > zero && after <= zero {
                counts.holders -= 1;
            }
        }
        Ok(())
    }

    fn credit(
        &self,
        db: &Transaction<'_>,
        r: &Nep5Record,
        to: AddressId,
        asset_id: AssetId,
        counts: &mut TokenCounts,
    ) -> Result<(), IndexerError> {
        let cache = &self.ctx.cache;
        let zero = BigDecimal::zero();
        let amount = &r.transfer.amount;
        let effect = EffectId::transfer_credit(r.tx_id, r.n);

        let (before, created) = cache.get_or_create_asset(to, asset_id, amount, r.block_index, Some(effect))?;
        if created {
            db::insert_addr_asset(db, to, asset_id, amount, r.block_time)?;
            counts.addresses += 1;
            if *amount > zero {
                counts.holders += 1;
            }
        } else if cache.add_balance(to, asset_id, amount, r.block_index, effect)? {
            mirror_balance(db, &self.ctx, to, asset_id)?;
            let after = cache.balance(to, asset_id).map(|b| b.balance).unwrap_or_default();
            if before <= zero && after > zero {
                counts.holders += 1;
            }
        }
        Ok(())
    }

    fn record_activity(&self, db: &Transaction<'_>, tx_id: Id, time: i64, addresses: &BTreeSet<AddressId>) -> Result<(), IndexerError> {
        for address_id in addresses {
            if self.ctx.cache.update_last_tx_time(*address_id, time)? {
                if let Some((created_at, last)) = self.ctx.cache.times(*address_id) {
                    db::update_address_times(db, *address_id, created_at, last)?;
                }
            }
            db::increment_address_transactions(db, *address_id, AddressTxKind::Nep5)?;
            db::insert_addr_tx(db, tx_id, *address_id, time, AddressTxKind::Nep5)?;
        }
        Ok(())
    }
}

impl Handler for Nep5Transfers {
    type Record = Nep5Record;

    const NAME: &'static str = "nep5";
    const CURSOR: Counter = Counter::LastTxPkNep5;
    const SOURCE: Source = Source::Invocations;

    fn process(&mut self, tx: &TxRecord, records: &mut Vec<Nep5Record>) {
        for (n, transfer) in self.decode(tx).into_iter().enumerate() {
            records.push(Nep5Record {
                tx_id: tx.id,
                n: n as u32,
                block_index: tx.block_index,
                block_time: tx.block_time,
                transfer,
            });
        }
    }

    fn commit(&mut self, db: &Transaction<'_>, records: Vec<Nep5Record>) -> Result<(), IndexerError> {
        self.create_addresses(db, &records)?;

        let mut counts: BTreeMap<AssetId, TokenCounts> = BTreeMap::new();
        let mut activity: BTreeMap<(Id, i64), BTreeSet<AddressId>> = BTreeMap::new();

        for r in &records {
            let asset_id = self.ctx.assets.resolve(&r.transfer.contract);
            db::insert_nep5_token(db, asset_id, &r.transfer.contract, r.block_index, r.block_time)?;
            let token = counts.entry(asset_id).or_default();
            token.transfers += 1;

            let from = r.transfer.from.as_deref().map(|a| self.address_id(a)).transpose()?;
            let to = self.address_id(&r.transfer.to)?;
            if let Some(from) = from {
                self.debit(db, r, from, asset_id, token)?;
            }
            self.credit(db, r, to, asset_id, token)?;

            db::insert_nep5_transfer(
                db,
                r.tx_id,
                r.n,
                asset_id,
                from,
                to,
                &r.transfer.amount,
                r.block_index,
                r.block_time,
            )?;

            let touched = activity.entry((r.tx_id, r.block_time)).or_default();
            touched.extend(from);
            touched.insert(to);
        }

        for (asset_id, c) in counts {
            db::increment_nep5_counters(db, asset_id, c.addresses, c.holders, c.transfers)?;
        }
        for ((tx_id, time), addresses) in activity {
            self.record_activity(db, tx_id, time, &addresses)?;
        }
        db::insert_registry_entries(db, &self.ctx.assets.take_unpersisted())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;
    use crate::db::test_pool;
    use crate::pipelines::fixtures::{apply, page, store};
    use crate::rpc::types::RawTx;
    use crate::script::builder::transfer_script;
    use crate::script::{AvmDecoder, script_hash_hex, script_hash_to_address};
    use crate::sync::ingest::fixtures::*;

    const TOKEN: [u8; 20] = [0x11; 20];
    const ALICE: [u8; 20] = [0x22; 20];
    const BOB: [u8; 20] = [0x33; 20];

    fn invocation(txid: &str, script: Vec<u8>) -> RawTx {
        let mut tx = raw_tx(txid, "InvocationTransaction", &[], &[]);
        tx.script = Some(hex::encode(script));
        tx
    }

    fn handler(ctx: &IngestContext) -> Nep5Transfers {
        Nep5Transfers::new(ctx.clone(), Arc::new(AvmDecoder))
    }

    fn token_counters(conn: &Connection, asset_id: AssetId) -> (i64, i64, i64) {
        conn.query_row(
            "SELECT addresses, holding_addresses, transfers FROM nep5 WHERE asset_id = ?1",
            [asset_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap()
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn mint_then_transfer_moves_token_balances() {
        let (_dir, pool) = test_pool();
        let ctx = context();
        store(
            &pool,
            &ctx,
            &[
                block_with(0, vec![invocation("0xa", transfer_script(&TOKEN, &[], &ALICE, &[100]))]),
                block_with(1, vec![invocation("0xb", transfer_script(&TOKEN, &ALICE, &BOB, &[30]))]),
            ],
        );

        apply(&pool, &mut handler(&ctx));

        let conn = pool.get().unwrap();
        let token = ctx.assets.get(&script_hash_hex(&TOKEN)).unwrap();
        let alice = ctx.addresses.get(&script_hash_to_address(&ALICE)).unwrap();
        let bob = ctx.addresses.get(&script_hash_to_address(&BOB)).unwrap();

        assert_eq!(ctx.cache.balance(alice, token).unwrap().balance, BigDecimal::from(70));
        assert_eq!(ctx.cache.balance(bob, token).unwrap().balance, BigDecimal::from(30));
        assert_eq!(db::get_addr_asset_balance(&conn, alice, token).unwrap(), Some(BigDecimal::from(70)));
        assert_eq!(db::get_addr_asset_balance(&conn, bob, token).unwrap(), Some(BigDecimal::from(30)));

        assert_eq!(token_counters(&conn, token), (2, 2, 2));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM nep5_tx WHERE from_address_id IS NULL"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM addr_tx WHERE asset_type = 'nep5'"), 3);
        assert_eq!(count(&conn, &format!("SELECT trans_nep5 FROM address WHERE id = {}", alice)), 2);
        assert_eq!(db::load_registry(&conn).unwrap(), vec![(token, script_hash_hex(&TOKEN))]);
    }

    #[test]
    fn emptying_an_account_drops_a_holder() {
        let (_dir, pool) = test_pool();
        let ctx = context();
        store(
            &pool,
            &ctx,
            &[block_with(
                0,
                vec![
                    invocation("0xa", transfer_script(&TOKEN, &[], &ALICE, &[10])),
                    invocation("0xb", transfer_script(&TOKEN, &ALICE, &BOB, &[10])),
                ],
            )],
        );

        apply(&pool, &mut handler(&ctx));

        let conn = pool.get().unwrap();
        let token = ctx.assets.get(&script_hash_hex(&TOKEN)).unwrap();
        assert_eq!(token_counters(&conn, token), (2, 1, 2));
    }

    #[test]
    fn scripts_without_transfers_still_advance_the_cursor() {
        let (_dir, pool) = test_pool();
        let ctx = context();
        let mut garbage = raw_tx("0xa", "InvocationTransaction", &[], &[]);
        garbage.script = Some("zz".to_string());
        store(
            &pool,
            &ctx,
            &[block_with(0, vec![garbage, invocation("0xb", vec![0x05, 0x01])])],
        );

        let mut records = Vec::new();
        let mut nep5 = handler(&ctx);
        for tx in page(&pool, Source::Invocations) {
            nep5.process(&tx, &mut records);
        }
        assert!(records.is_empty());

        apply(&pool, &mut nep5);
        let conn = pool.get().unwrap();
        assert_eq!(db::get_counter(&conn, Counter::LastTxPkNep5).unwrap(), 2);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM nep5"), 0);
    }
}
