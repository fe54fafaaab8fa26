use std::sync::Arc;

use log::{debug, info};
use rusqlite::Transaction;

use super::{Handler, Source};
use crate::db::{self, Counter};
use crate::error::IndexerError;
use crate::models::{ContractRegistration, Id, TxRecord};
use crate::script::ScriptDecoder;

/// Scripts this short cannot carry a deployment.
const MIN_SCRIPT_HEX_LEN: usize = 42;

/// Hex of the deployment syscall names a registration script ends with.
const DEPLOY_SUFFIXES: [&str; 4] = [
    // Neo.Contract.Create
    "4e656f2e436f6e74726163742e437265617465",
    // Neo.Contract.Migrate
    "4e656f2e436f6e74726163742e4d696772617465",
    // AntShares.Contract.Create
    "416e745368617265732e436f6e74726163742e437265617465",
    // AntShares.Contract.Migrate
    "416e745368617265732e436f6e74726163742e4d696772617465",
];

/// Known invocation whose script matches the deployment shape but does not decode.
const IGNORED_TXID: &str = "b00a0d7b752ba935206e1db67079c186ba38a4696d3afe28814a4834b2254cbe";

/// Records contract deployments found in invocation transactions.
pub struct SmartContracts {
    decoder: Arc<dyn ScriptDecoder>,
}

impl SmartContracts {
    pub fn new(decoder: Arc<dyn ScriptDecoder>) -> Self {
        Self { decoder }
    }
}

pub(crate) fn is_deployment_candidate(txid: &str, script: &str) -> bool {
    if script.len() <= MIN_SCRIPT_HEX_LEN || txid.trim_start_matches("0x") == IGNORED_TXID {
        return false;
    }
    let script = script.to_ascii_lowercase();
    DEPLOY_SUFFIXES.iter().any(|suffix| script.ends_with(suffix))
}

impl Handler for SmartContracts {
    type Record = (Id, ContractRegistration);

    const NAME: &'static str = "smart_contracts";
    const CURSOR: Counter = Counter::LastTxPkForSc;
    const SOURCE: Source = Source::Invocations;

    fn process(&mut self, tx: &TxRecord, records: &mut Vec<(Id, ContractRegistration)>) {
        let Some(script) = tx.script.as_deref() else {
            return;
        };
        if !is_deployment_candidate(&tx.txid, script) {
            return;
        }
        let decoded = hex::decode(script)
            .map_err(|e| e.to_string())
            .and_then(|bytes| self.decoder.registration(&bytes).map_err(|e| e.to_string()));
        match decoded {
            Ok(Some(registration)) => records.push((tx.id, registration)),
            Ok(None) => {},
            Err(e) => debug!(txid = &*tx.txid, error = &*e; "Skipping undecodable deployment"),
        }
    }

    fn commit(&mut self, db: &Transaction<'_>, records: Vec<(Id, ContractRegistration)>) -> Result<(), IndexerError> {
        for (tx_id, contract) in &records {
            info!(
                tx_id = *tx_id,
                script_hash = &*contract.script_hash,
                name = &*contract.name;
                "Contract deployed"
            );
            db::insert_contract(db, *tx_id, contract)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::pipelines::fixtures::{apply, store};
    use crate::script::builder::deploy_script;
    use crate::script::{AvmDecoder, hash160, script_hash_hex};
    use crate::sync::ingest::fixtures::*;

    #[test]
    fn candidate_filter() {
        let create = "4e656f2e436f6e74726163742e437265617465";
        let long = format!("{}{}", "00".repeat(20), create);
        assert!(is_deployment_candidate("0x01", &long));
        assert!(is_deployment_candidate("0x01", &long.to_uppercase()));
        assert!(!is_deployment_candidate("0x01", create));
        assert!(!is_deployment_candidate(&format!("0x{}", IGNORED_TXID), &long));
        assert!(!is_deployment_candidate("0x01", &format!("{}f1", long)));
    }

    #[test]
    fn deployments_are_stored_with_their_metadata() {
        let (_dir, pool) = test_pool();
        let ctx = context();
        let code = vec![0x52, 0xc5, 0x6b, 0x61, 0x66];

        let mut deploy = raw_tx("0xa", "InvocationTransaction", &[], &[]);
        deploy.script = Some(hex::encode(deploy_script(&code, "Token")));
        let mut other = raw_tx("0xb", "InvocationTransaction", &[], &[]);
        other.script = Some("00".repeat(40));
        store(&pool, &ctx, &[block_with(0, vec![deploy, other])]);

        apply(&pool, &mut SmartContracts::new(Arc::new(AvmDecoder)));

        let conn = pool.get().unwrap();
        let (tx_id, hash, name, storage): (i64, String, String, bool) = conn
            .query_row(
                "SELECT tx_id, script_hash, name, need_storage FROM smartcontract_info",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(tx_id, 1);
        assert_eq!(hash, script_hash_hex(&hash160(&code)));
        assert_eq!(name, "Token");
        assert!(storage);
        assert_eq!(db::get_counter(&conn, Counter::LastTxPkForSc).unwrap(), 2);
    }
}
