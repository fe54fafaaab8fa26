use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Mutex;

use bigdecimal::{BigDecimal, Zero};
use log::debug;

use super::{CacheError, lock};
use crate::models::{AccountBalanceRow, AccountRow, AddressId, AssetId, Height, Id};

/// Identity of a single relative balance adjustment.
///
/// Two adjustments at the same height are distinguished by the transaction and the slot that
/// produced them, which lets a replayed transaction be recognised and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectId {
    Input { tx_id: Id, n: u32 },
    Output { tx_id: Id, n: u32 },
    Transfer { tx_id: Id, n: u32, credit: bool },
}

impl EffectId {
    pub fn vin(tx_id: Id, n: u32) -> Self {
        EffectId::Input { tx_id, n }
    }

    pub fn vout(tx_id: Id, n: u32) -> Self {
        EffectId::Output { tx_id, n }
    }

    pub fn transfer_debit(tx_id: Id, n: u32) -> Self {
        EffectId::Transfer { tx_id, n, credit: false }
    }

    pub fn transfer_credit(tx_id: Id, n: u32) -> Self {
        EffectId::Transfer { tx_id, n, credit: true }
    }
}

/// Balance of one asset held by one address, with the height it was last mutated at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetBalance {
    pub balance: BigDecimal,
    pub applied_at: Height,
}

#[derive(Debug)]
struct BalanceEntry {
    balance: BigDecimal,
    applied_at: Height,
    // Relative effects already applied at `applied_at`.
    applied: HashSet<EffectId>,
}

impl BalanceEntry {
    fn new(balance: BigDecimal, applied_at: Height) -> Self {
        Self {
            balance,
            applied_at,
            applied: HashSet::new(),
        }
    }

    fn advance(&mut self, height: Height) {
        if height > self.applied_at {
            self.applied_at = height;
            self.applied.clear();
        }
    }

    fn set(&mut self, value: BigDecimal, height: Height) -> bool {
        if height < self.applied_at {
            return false;
        }
        self.advance(height);
        if self.balance == value {
            return false;
        }
        self.balance = value;
        true
    }

    fn adjust(&mut self, delta: &BigDecimal, height: Height, effect: EffectId) -> bool {
        if delta.is_zero() || height < self.applied_at {
            return false;
        }
        if height == self.applied_at && self.applied.contains(&effect) {
            return false;
        }
        self.advance(height);
        self.applied.insert(effect);
        self.balance += delta;
        true
    }
}

#[derive(Debug)]
struct Account {
    created_at: i64,
    last_transaction_time: i64,
    assets: HashMap<AssetId, BalanceEntry>,
}

/// Per-address, per-asset balances shared by the persister and the downstream pipelines.
///
/// Every mutation is guarded by the entry's height watermark: anything older than the last
/// applied height is ignored, so re-processing a block after a restart cannot double count.
#[derive(Debug, Default)]
pub struct BalanceCache {
    accounts: Mutex<HashMap<AddressId, Account>>,
}

impl BalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrates the cache from storage. Loaded balances carry watermark 0.
    pub fn load(&self, accounts: Vec<AccountRow>, balances: Vec<AccountBalanceRow>) -> Result<(), CacheError> {
        let mut map = lock(&self.accounts);
        for row in accounts {
            map.insert(
                row.id,
                Account {
                    created_at: row.created_at,
                    last_transaction_time: row.last_transaction_time,
                    assets: HashMap::new(),
                },
            );
        }
        for row in balances {
            let balance = BigDecimal::from_str(&row.balance).map_err(|_| CacheError::InvalidBalance(row.balance.clone()))?;
            let account = map
                .get_mut(&row.address_id)
                .ok_or(CacheError::MissingAddress(row.address_id))?;
            account.assets.insert(row.asset_id, BalanceEntry::new(balance, 0));
        }
        debug!(accounts = map.len(); "Balance cache loaded");
        Ok(())
    }

    /// Returns `true` when the address was not known before this call.
    pub fn get_or_create(&self, address_id: AddressId, tx_time: i64) -> bool {
        let mut map = lock(&self.accounts);
        if map.contains_key(&address_id) {
            return false;
        }
        map.insert(
            address_id,
            Account {
                created_at: tx_time,
                last_transaction_time: tx_time,
                assets: HashMap::new(),
            },
        );
        true
    }

    /// Returns the current balance and whether the entry was created by this call.
    ///
    /// `origin` is the effect that produced the initial balance, if any. It counts as applied
    /// so that replaying it later through [`BalanceCache::add_balance`] is a no-op.
    pub fn get_or_create_asset(
        &self,
        address_id: AddressId,
        asset_id: AssetId,
        initial: &BigDecimal,
        height: Height,
        origin: Option<EffectId>,
    ) -> Result<(BigDecimal, bool), CacheError> {
        let mut map = lock(&self.accounts);
        let account = map.get_mut(&address_id).ok_or(CacheError::MissingAddress(address_id))?;
        if let Some(entry) = account.assets.get(&asset_id) {
            return Ok((entry.balance.clone(), false));
        }
        let mut entry = BalanceEntry::new(initial.clone(), height);
        entry.applied.extend(origin);
        account.assets.insert(asset_id, entry);
        Ok((initial.clone(), true))
    }

    /// Sets an absolute balance. Returns `true` only if the stored value changed.
    pub fn update_balance(
        &self,
        address_id: AddressId,
        asset_id: AssetId,
        value: BigDecimal,
        height: Height,
    ) -> Result<bool, CacheError> {
        self.with_entry(address_id, asset_id, |entry| entry.set(value, height))
    }

    pub fn add_balance(
        &self,
        address_id: AddressId,
        asset_id: AssetId,
        delta: &BigDecimal,
        height: Height,
        effect: EffectId,
    ) -> Result<bool, CacheError> {
        self.with_entry(address_id, asset_id, |entry| entry.adjust(delta, height, effect))
    }

    pub fn subtract_balance(
        &self,
        address_id: AddressId,
        asset_id: AssetId,
        delta: &BigDecimal,
        height: Height,
        effect: EffectId,
    ) -> Result<bool, CacheError> {
        let negated = -delta.clone();
        self.with_entry(address_id, asset_id, |entry| entry.adjust(&negated, height, effect))
    }

    pub fn balance(&self, address_id: AddressId, asset_id: AssetId) -> Option<AssetBalance> {
        let map = lock(&self.accounts);
        map.get(&address_id)
            .and_then(|a| a.assets.get(&asset_id))
            .map(|e| AssetBalance {
                balance: e.balance.clone(),
                applied_at: e.applied_at,
            })
    }

    /// Lowers the creation time if `time` is earlier. Returns `true` when it changed.
    pub fn update_created_time(&self, address_id: AddressId, time: i64) -> Result<bool, CacheError> {
        let mut map = lock(&self.accounts);
        let account = map.get_mut(&address_id).ok_or(CacheError::MissingAddress(address_id))?;
        if time < account.created_at {
            account.created_at = time;
            return Ok(true);
        }
        Ok(false)
    }

    /// Raises the last transaction time if `time` is later. Returns `true` when it changed.
    pub fn update_last_tx_time(&self, address_id: AddressId, time: i64) -> Result<bool, CacheError> {
        let mut map = lock(&self.accounts);
        let account = map.get_mut(&address_id).ok_or(CacheError::MissingAddress(address_id))?;
        if time > account.last_transaction_time {
            account.last_transaction_time = time;
            return Ok(true);
        }
        Ok(false)
    }

    /// `(created_at, last_transaction_time)` of a known address.
    pub fn times(&self, address_id: AddressId) -> Option<(i64, i64)> {
        lock(&self.accounts)
            .get(&address_id)
            .map(|a| (a.created_at, a.last_transaction_time))
    }

    pub fn len(&self) -> usize {
        lock(&self.accounts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entry<R>(
        &self,
        address_id: AddressId,
        asset_id: AssetId,
        f: impl FnOnce(&mut BalanceEntry) -> R,
    ) -> Result<R, CacheError> {
        let mut map = lock(&self.accounts);
        let entry = map
            .get_mut(&address_id)
            .ok_or(CacheError::MissingAddress(address_id))?
            .assets
            .get_mut(&asset_id)
            .ok_or(CacheError::MissingAsset { address_id, asset_id })?;
        Ok(f(entry))
    }
}
