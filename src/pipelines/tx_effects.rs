use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bigdecimal::{BigDecimal, Zero};
use rusqlite::Transaction;

use super::{Handler, Source};
use crate::cache::{AssetRegistry, BalanceCache};
use crate::db::{self, AddressTxKind, Counter};
use crate::error::IndexerError;
use crate::models::{AddressId, AssetId, GAS_ASSET, TxRecord, TxType};

/// Per-transaction bookkeeping that does not move balances: address activity times and
/// counters, `addr_tx` rows, pair and asset transaction counts, and the circulating amount
/// of assets created by claims and issues.
pub struct TxEffects {
    cache: Arc<BalanceCache>,
    assets: Arc<AssetRegistry>,
}

impl TxEffects {
    pub fn new(cache: Arc<BalanceCache>, assets: Arc<AssetRegistry>) -> Self {
        Self { cache, assets }
    }

    fn apply(&self, db: &Transaction<'_>, tx: &TxRecord) -> Result<(), IndexerError> {
        for address_id in tx.touched_addresses() {
            let earlier = self.cache.update_created_time(address_id, tx.block_time)?;
            let later = self.cache.update_last_tx_time(address_id, tx.block_time)?;
            if earlier || later {
                if let Some((created_at, last)) = self.cache.times(address_id) {
                    db::update_address_times(db, address_id, created_at, last)?;
                }
            }
            db::increment_address_transactions(db, address_id, AddressTxKind::Asset)?;
            db::insert_addr_tx(db, tx.id, address_id, tx.block_time, AddressTxKind::Asset)?;
        }

        let pairs: BTreeSet<(AddressId, AssetId)> = tx
            .spent
            .iter()
            .chain(tx.created.iter())
            .map(|o| (o.address_id, o.asset_id))
            .collect();
        let assets: BTreeSet<AssetId> = pairs.iter().map(|(_, asset)| *asset).collect();
        for (address_id, asset_id) in &pairs {
            db::touch_addr_asset(db, *address_id, *asset_id, tx.block_time)?;
        }
        for asset_id in assets {
            db::increment_asset_transactions(db, asset_id, 1)?;
        }

        for (asset_id, amount) in self.minted(tx) {
            db::add_asset_available(db, asset_id, &amount)?;
        }
        Ok(())
    }

    /// Amounts brought into circulation by `tx`: claimed GAS, or issued non-GAS assets.
    fn minted(&self, tx: &TxRecord) -> BTreeMap<AssetId, BigDecimal> {
        let gas = self.assets.get(GAS_ASSET);
        let mut minted: BTreeMap<AssetId, BigDecimal> = BTreeMap::new();
        for out in &tx.created {
            let counts = match tx.tx_type {
                TxType::Claim => Some(out.asset_id) == gas,
                TxType::Issue => Some(out.asset_id) != gas,
                _ => false,
            };
            if counts {
                *minted.entry(out.asset_id).or_insert_with(BigDecimal::zero) += &out.value;
            }
        }
        minted
    }
}

impl Handler for TxEffects {
    type Record = TxRecord;

    const NAME: &'static str = "tx_effects";
    const CURSOR: Counter = Counter::LastTxPk;
    const SOURCE: Source = Source::Transfers;

    fn process(&mut self, tx: &TxRecord, records: &mut Vec<TxRecord>) {
        records.push(tx.clone());
    }

    fn commit(&mut self, db: &Transaction<'_>, records: Vec<TxRecord>) -> Result<(), IndexerError> {
        for tx in &records {
            self.apply(db, tx)?;
        }
        Ok(())
    }
}
