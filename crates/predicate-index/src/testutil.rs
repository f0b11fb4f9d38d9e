// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory [`PrimaryStore`] for tests and examples, gated behind the
//! `test-util` feature the same way the rest of this tree gates mock
//! collaborators.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::address::Address;
use crate::primary::{PrimaryRecord, PrimaryStore};

struct Slot<K, V> {
    key: K,
    value: V,
    is_tombstone: bool,
}

/// A primary store backed by a `HashMap`, with every write — including
/// deletes — allocating a fresh address (pure RCU, never in-place). Useful
/// for exercising [`crate::index_manager::IndexManager`] without a real
/// host store.
pub struct MockPrimary<K, V> {
    by_address: RwLock<HashMap<Address, Slot<K, V>>>,
    current_for_key: RwLock<HashMap<K, Address>>,
    cursor: AtomicU64,
}

impl<K, V> Default for MockPrimary<K, V> {
    fn default() -> Self {
        MockPrimary {
            by_address: RwLock::new(HashMap::new()),
            current_for_key: RwLock::new(HashMap::new()),
            cursor: AtomicU64::new(Address::OLDEST.get()),
        }
    }
}

impl<K: Clone + Eq + Hash, V: Clone> MockPrimary<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> Address {
        Address::new(self.cursor.fetch_add(1, Ordering::AcqRel))
    }

    /// Inserts or RCUs `key` to `value`, returning `(address, previous_address)`.
    /// `previous_address` is [`Address::INVALID`] for a brand new key.
    pub fn upsert(&self, key: K, value: V) -> (Address, Address) {
        let previous = self
            .current_for_key
            .read()
            .get(&key)
            .copied()
            .unwrap_or(Address::INVALID);
        let address = self.allocate();
        self.by_address.write().insert(
            address,
            Slot {
                key: key.clone(),
                value,
                is_tombstone: false,
            },
        );
        self.current_for_key.write().insert(key, address);
        (address, previous)
    }

    /// Writes a tombstone for `key` at a fresh address, returning
    /// `(address, previous_address)`. No-op (returns `None`) if the key
    /// isn't currently live.
    pub fn delete(&self, key: &K) -> Option<(Address, Address)> {
        let previous = *self.current_for_key.read().get(key)?;
        let address = self.allocate();
        let value = self.by_address.read().get(&previous)?.value.clone();
        self.by_address.write().insert(
            address,
            Slot {
                key: key.clone(),
                value,
                is_tombstone: true,
            },
        );
        self.current_for_key.write().insert(key.clone(), address);
        Some((address, previous))
    }
}

impl<K: Clone + Eq + Hash + Send + Sync, V: Clone + Send + Sync> PrimaryStore<K, V> for MockPrimary<K, V> {
    fn read(&self, key: &K) -> Option<(Address, PrimaryRecord<K, V>)> {
        let address = *self.current_for_key.read().get(key)?;
        self.by_address.read().get(&address).map(|slot| {
            (
                address,
                PrimaryRecord {
                    key: slot.key.clone(),
                    value: slot.value.clone(),
                    is_tombstone: slot.is_tombstone,
                },
            )
        })
    }

    fn read_at_address(&self, address: Address) -> Option<PrimaryRecord<K, V>> {
        self.by_address.read().get(&address).map(|slot| PrimaryRecord {
            key: slot.key.clone(),
            value: slot.value.clone(),
            is_tombstone: slot.is_tombstone,
        })
    }

    fn lookup_address_for_key(&self, key: &K) -> Address {
        self.current_for_key
            .read()
            .get(key)
            .copied()
            .unwrap_or(Address::INVALID)
    }

    fn complete_pending(&self, _blocking: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_delete_round_trips() {
        let primary: MockPrimary<u64, String> = MockPrimary::new();
        let (addr1, prev1) = primary.upsert(1, "a".to_string());
        assert!(!prev1.is_valid());
        assert_eq!(primary.lookup_address_for_key(&1), addr1);

        let (addr2, prev2) = primary.upsert(1, "b".to_string());
        assert_eq!(prev2, addr1);
        assert_eq!(primary.read(&1).unwrap().1.value, "b");

        let (addr3, prev3) = primary.delete(&1).unwrap();
        assert_eq!(prev3, addr2);
        assert!(primary.read_at_address(addr3).unwrap().is_tombstone);
    }
}
