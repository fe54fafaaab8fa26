use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use rusqlite::Transaction;

use super::{Handler, Source};
use crate::cache::AssetRegistry;
use crate::db::{self, Counter};
use crate::error::IndexerError;
use crate::models::{AddressId, GAS_ASSET, TxRecord};

/// Net GAS movement of one address within one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasDelta {
    pub address_id: AddressId,
    pub date: String,
    pub delta: BigDecimal,
}

/// Keeps one running GAS balance row per address and UTC day.
pub struct GasDailyBalance {
    assets: Arc<AssetRegistry>,
    latest: HashMap<AddressId, (String, BigDecimal)>,
}

impl GasDailyBalance {
    pub fn new(assets: Arc<AssetRegistry>) -> Self {
        Self {
            assets,
            latest: HashMap::new(),
        }
    }

    fn latest(&mut self, db: &Transaction<'_>, address_id: AddressId) -> Result<Option<(String, BigDecimal)>, IndexerError> {
        if let Some(entry) = self.latest.get(&address_id) {
            return Ok(Some(entry.clone()));
        }
        Ok(db::get_latest_gas_balance(db, address_id)?)
    }
}

pub(crate) fn utc_date(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

impl Handler for GasDailyBalance {
    type Record = GasDelta;

    const NAME: &'static str = "gas_balance";
    const CURSOR: Counter = Counter::LastTxPkGasBalance;
    const SOURCE: Source = Source::Transfers;

    fn process(&mut self, tx: &TxRecord, records: &mut Vec<GasDelta>) {
        let Some(gas) = self.assets.get(GAS_ASSET) else {
            return;
        };

        let mut net: BTreeMap<AddressId, BigDecimal> = BTreeMap::new();
        for out in tx.spent.iter().filter(|o| o.asset_id == gas) {
            *net.entry(out.address_id).or_insert_with(BigDecimal::zero) -= &out.value;
        }
        for out in tx.created.iter().filter(|o| o.asset_id == gas) {
            *net.entry(out.address_id).or_insert_with(BigDecimal::zero) += &out.value;
        }

        let date = utc_date(tx.block_time);
        records.extend(
            net.into_iter()
                .filter(|(_, delta)| !delta.is_zero())
                .map(|(address_id, delta)| GasDelta {
                    address_id,
                    date: date.clone(),
                    delta,
                }),
        );
    }

    fn commit(&mut self, db: &Transaction<'_>, records: Vec<GasDelta>) -> Result<(), IndexerError> {
        for record in records {
            let previous = self
                .latest(db, record.address_id)?
                .map(|(_, balance)| balance)
                .unwrap_or_else(BigDecimal::zero);
            let balance = previous + &record.delta;
            db::upsert_gas_balance(db, record.address_id, &record.date, &balance)?;
            self.latest.insert(record.address_id, (record.date, balance));
        }
        Ok(())
    }
}
