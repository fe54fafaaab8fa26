use std::collections::BTreeSet;

use rusqlite::Transaction;

use super::{Handler, Source};
use crate::db::{self, AssetTxRow, Counter};
use crate::error::IndexerError;
use crate::models::TxRecord;

/// Maintains `asset_tx`: which transactions moved which asset for which address.
#[derive(Debug, Default)]
pub struct AssetTxIndex;

impl Handler for AssetTxIndex {
    type Record = AssetTxRow;

    const NAME: &'static str = "asset_tx";
    const CURSOR: Counter = Counter::LastAssetTxPk;
    const SOURCE: Source = Source::Transfers;
    const PAGE_SIZE: i64 = 50;
    const FLUSH_THRESHOLD: usize = 100;

    fn process(&mut self, tx: &TxRecord, records: &mut Vec<AssetTxRow>) {
        let rows: BTreeSet<AssetTxRow> = tx
            .spent
            .iter()
            .chain(tx.created.iter())
            .map(|o| AssetTxRow {
                address_id: o.address_id,
                asset_id: o.asset_id,
                tx_id: tx.id,
            })
            .collect();
        records.extend(rows);
    }

    fn commit(&mut self, db: &Transaction<'_>, records: Vec<AssetTxRow>) -> Result<(), IndexerError> {
        db::insert_asset_tx(db, &records)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;
    use crate::db::test_pool;
    use crate::models::NEO_ASSET;
    use crate::pipelines::fixtures::{apply, page, store};
    use crate::sync::ingest::fixtures::*;

    fn rows(conn: &Connection) -> Vec<(i64, i64, i64)> {
        let mut stmt = conn
            .prepare("SELECT address_id, asset_id, tx_id FROM asset_tx ORDER BY tx_id, address_id, asset_id")
            .unwrap();
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn one_row_per_distinct_address_asset_pair() {
        let (_dir, pool) = test_pool();
        let ctx = context();
        store(
            &pool,
            &ctx,
            &[
                block_with(
                    0,
                    vec![raw_tx(
                        "0xa",
                        "MinerTransaction",
                        &[],
                        &[("AX", GAS, "1"), ("AX", GAS, "2"), ("AX", NEO_ASSET, "3")],
                    )],
                ),
                block_with(
                    1,
                    vec![raw_tx("0xb", "ContractTransaction", &[("0xa", 0), ("0xa", 1)], &[("AY", GAS, "3")])],
                ),
            ],
        );

        let mut records = Vec::new();
        let mut handler = AssetTxIndex;
        for tx in page(&pool, Source::Transfers) {
            handler.process(&tx, &mut records);
        }
        assert_eq!(records.len(), 4);

        apply(&pool, &mut AssetTxIndex);
        let x = ctx.addresses.get("AX").unwrap();
        let y = ctx.addresses.get("AY").unwrap();
        let gas = ctx.assets.get(GAS).unwrap();
        let neo = ctx.assets.get(NEO_ASSET).unwrap();

        let mut expected = vec![(x, gas, 1), (x, neo, 1), (x, gas, 2), (y, gas, 2)];
        expected.sort_by_key(|(a, s, t)| (*t, *a, *s));
        assert_eq!(rows(&pool.get().unwrap()), expected);
    }

    #[test]
    fn reapplying_a_batch_adds_nothing() {
        let (_dir, pool) = test_pool();
        let ctx = context();
        store(
            &pool,
            &ctx,
            &[block_with(0, vec![raw_tx("0xa", "MinerTransaction", &[], &[("AX", GAS, "1")])])],
        );

        apply(&pool, &mut AssetTxIndex);
        apply(&pool, &mut AssetTxIndex);

        let conn = pool.get().unwrap();
        assert_eq!(rows(&conn).len(), 1);
        assert_eq!(db::get_counter(&conn, Counter::LastAssetTxPk).unwrap(), 1);
    }
}
