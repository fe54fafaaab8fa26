use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;

use log::debug;

use super::lock;

/// What a registry hands out ids for.
pub trait RegistryKind {
    const LABEL: &'static str;
    const FIRST_ID: i64;
    /// Whether new ids must be written out by the committing stage.
    const TRACK_UNPERSISTED: bool;
}

#[derive(Debug)]
pub enum AssetKind {}

impl RegistryKind for AssetKind {
    const LABEL: &'static str = "asset";
    const FIRST_ID: i64 = 0;
    const TRACK_UNPERSISTED: bool = true;
}

/// Address ids are persisted through the `address` row created alongside the first balance.
#[derive(Debug)]
pub enum AddressKind {}

impl RegistryKind for AddressKind {
    const LABEL: &'static str = "address";
    const FIRST_ID: i64 = 1;
    const TRACK_UNPERSISTED: bool = false;
}

pub type AssetRegistry = Registry<AssetKind>;
pub type AddressRegistry = Registry<AddressKind>;

#[derive(Debug, Default)]
struct Inner {
    by_external: HashMap<String, i64>,
    by_id: HashMap<i64, String>,
    next_id: i64,
    unpersisted: Vec<(i64, String)>,
}

/// Bijective map between external identifiers and dense surrogate ids.
///
/// Ids are handed out in increasing order and never reused: after [`Registry::load`] the
/// next id continues past the largest loaded one.
#[derive(Debug)]
pub struct Registry<K: RegistryKind> {
    inner: Mutex<Inner>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: RegistryKind> Default for Registry<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: K::FIRST_ID,
                ..Inner::default()
            }),
            _kind: PhantomData,
        }
    }
}

impl<K: RegistryKind> Registry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, entries: impl IntoIterator<Item = (i64, String)>) {
        let mut inner = lock(&self.inner);
        for (id, external) in entries {
            inner.next_id = inner.next_id.max(id + 1);
            inner.by_id.insert(id, external.clone());
            inner.by_external.insert(external, id);
        }
        debug!(kind = K::LABEL, entries = inner.by_id.len(), next_id = inner.next_id; "Registry loaded");
    }

    /// Returns the id of `external`, allocating the next one if it has never been seen.
    pub fn resolve(&self, external: &str) -> i64 {
        let mut inner = lock(&self.inner);
        if let Some(id) = inner.by_external.get(external) {
            return *id;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.by_external.insert(external.to_string(), id);
        inner.by_id.insert(id, external.to_string());
        if K::TRACK_UNPERSISTED {
            inner.unpersisted.push((id, external.to_string()));
        }
        id
    }

    pub fn get(&self, external: &str) -> Option<i64> {
        lock(&self.inner).by_external.get(external).copied()
    }

    pub fn external(&self, id: i64) -> Option<String> {
        lock(&self.inner).by_id.get(&id).cloned()
    }

    /// Drains ids allocated since the last call so they can be written in the caller's commit.
    pub fn take_unpersisted(&self) -> Vec<(i64, String)> {
        std::mem::take(&mut lock(&self.inner).unpersisted)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn resolve_is_stable_and_dense() {
        let registry = AssetRegistry::new();
        let neo = registry.resolve("0xc56f33fc");
        let gas = registry.resolve("0x602c79718b");

        assert_eq!(neo, 0);
        assert_eq!(gas, 1);
        assert_eq!(registry.resolve("0xc56f33fc"), neo);
        assert_eq!(registry.external(gas).as_deref(), Some("0x602c79718b"));
        assert_eq!(registry.take_unpersisted().len(), 2);
        assert!(registry.take_unpersisted().is_empty());
    }

    #[test]
    fn concurrent_resolution_of_same_id_agrees() {
        let registry = Arc::new(AssetRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.resolve("0xabc"))
            })
            .collect();

        let ids: HashSet<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_resolution_of_distinct_ids_never_collides() {
        let registry = Arc::new(AssetRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.resolve(&format!("0x{:02x}", i)))
            })
            .collect();

        let ids: HashSet<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 16);
        assert_eq!(ids.iter().max(), Some(&15));
    }

    #[test]
    fn load_continues_after_largest_id() {
        let registry = AddressRegistry::new();
        registry.load(vec![(1, "AQ".to_string()), (7, "AZ".to_string())]);

        assert_eq!(registry.resolve("AZ"), 7);
        assert_eq!(registry.resolve("AN"), 8);
        // Addresses are persisted through their account row, not the registry.
        assert!(registry.take_unpersisted().is_empty());
    }
}
