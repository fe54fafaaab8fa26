use log::debug;
use rusqlite::{Connection, named_params};

use super::error::DbResult;
use crate::models::{ContractRegistration, Id};

pub fn insert_contract(conn: &Connection, tx_id: Id, contract: &ContractRegistration) -> DbResult<()> {
    debug!(tx_id = tx_id, script_hash = &*contract.script_hash; "DB: Inserting contract registration");

    conn.prepare_cached(
        r#"
        INSERT OR IGNORE INTO smartcontract_info (
            tx_id, script_hash, name, version, author, email, description,
            need_storage, parameter_list, return_type
        ) VALUES (
            :tx_id, :script_hash, :name, :version, :author, :email, :description,
            :need_storage, :parameter_list, :return_type
        )
        "#,
    )?
    .execute(named_params! {
        ":tx_id": tx_id,
        ":script_hash": contract.script_hash,
        ":name": contract.name,
        ":version": contract.version,
        ":author": contract.author,
        ":email": contract.email,
        ":description": contract.description,
        ":need_storage": contract.need_storage,
        ":parameter_list": contract.parameter_list,
        ":return_type": contract.return_type,
    })?;
    Ok(())
}
