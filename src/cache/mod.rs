//! Shared in-memory state: per-address balances and the surrogate id registries.
//!
//! Both structures sit behind a single `std::sync::Mutex` each. The lock is only ever held for
//! the map operation itself, never across an `.await` or a database call.

use thiserror::Error;

use crate::models::{AddressId, AssetId};

mod balance;
pub use balance::{AssetBalance, BalanceCache, EffectId};

mod registry;
pub use registry::{AddressKind, AddressRegistry, AssetKind, AssetRegistry, Registry, RegistryKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Address {0} is not in the balance cache")]
    MissingAddress(AddressId),

    #[error("Address {address_id} holds no entry for asset {asset_id}")]
    MissingAsset { address_id: AddressId, asset_id: AssetId },

    #[error("Stored balance '{0}' is not a decimal")]
    InvalidBalance(String),
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A panic while holding the lock leaves the maps structurally intact.
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
