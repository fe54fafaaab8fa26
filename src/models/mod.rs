//! Data models shared by the persister, the caches and the downstream pipelines.
//!
//! Raw node responses live in [`crate::rpc::types`]; everything here is expressed in terms of
//! the surrogate ids assigned by the registries and the dense transaction primary keys.
//!
//! # Key Types
//!
//! - [`TxType`] - Transaction kinds reported by the node
//! - [`StoredOutput`] - A transaction output as persisted, with resolved address and asset ids
//! - [`TxRecord`] - A persisted transaction joined with the outputs it spends and creates
//! - [`AccountRow`] / [`AccountBalanceRow`] - Rows used to rehydrate the balance cache

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

pub mod tx_type;
pub use tx_type::TxType;

/// Database primary key type (SQLite integer).
pub type Id = i64;

/// Surrogate id of an address, assigned on first observation.
pub type AddressId = i64;

/// Surrogate id of an asset, dense and monotonic.
pub type AssetId = i64;

/// Block height. `-1` stands for "nothing yet" (empty database, unreachable endpoint).
pub type Height = i64;

/// External id of the GAS utility token.
pub const GAS_ASSET: &str = "0x602c79718b16e442de58778e148d0b1084e3b2dffd5de6b7b16cee7969282de7";

/// External id of the NEO governing token.
pub const NEO_ASSET: &str = "0xc56f33fc6ecfcd0c225c4ab356fee59390af8560be0e930faebe74a6daff7c9b";

/// A transaction output with resolved surrogate ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOutput {
    pub tx_id: Id,
    pub n: u32,
    pub address_id: AddressId,
    pub asset_id: AssetId,
    pub value: BigDecimal,
}

/// A persisted transaction as seen by the downstream pipelines.
///
/// `spent` holds the outputs referenced by the transaction's inputs, in input order.
#[derive(Debug, Clone)]
pub struct TxRecord {
    pub id: Id,
    pub txid: String,
    pub block_index: Height,
    pub block_time: i64,
    pub tx_type: TxType,
    pub script: Option<String>,
    pub spent: Vec<StoredOutput>,
    pub created: Vec<StoredOutput>,
}

impl TxRecord {
    /// Every address touched by this transaction, sorted and deduplicated.
    pub fn touched_addresses(&self) -> Vec<AddressId> {
        let mut ids: Vec<AddressId> = self
            .spent
            .iter()
            .chain(self.created.iter())
            .map(|o| o.address_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountRow {
    pub id: AddressId,
    pub address: String,
    pub created_at: i64,
    pub last_transaction_time: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountBalanceRow {
    pub address_id: AddressId,
    pub asset_id: AssetId,
    pub balance: String,
}

/// Metadata of a contract deployed through `Neo.Contract.Create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractRegistration {
    pub script_hash: String,
    pub parameter_list: String,
    pub return_type: String,
    pub need_storage: bool,
    pub name: String,
    pub version: String,
    pub author: String,
    pub email: String,
    pub description: String,
}

/// A NEP5 `transfer(from, to, amount)` call found in an invocation script.
///
/// `from` is `None` for mint-style calls where the sender argument is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nep5Transfer {
    pub contract: String,
    pub from: Option<String>,
    pub to: String,
    pub amount: BigDecimal,
}
