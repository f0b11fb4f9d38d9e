// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The two-step liveness check (§4.5): a predicate chain can legitimately
//! point at a primary address that a later RCU has since superseded
//! (RCU always allocates a new address rather than mutating in place, and
//! the secondary chain is never eagerly pruned when that happens). Filtering
//! those stale entries out of query results needs two reads: one at the
//! candidate address to recover its key, one keyed lookup to find out
//! whether that address is still the *current* one for that key.

use crate::address::Address;
use crate::primary::PrimaryStore;

/// Outcome of checking whether a candidate primary address is still live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness<K, V> {
    /// `address` is still the current version for its key.
    Live(K, V),
    /// `address` is current for its key, but the key has been deleted.
    Deleted,
    /// `address` has been superseded by a newer write (or reclaimed
    /// outright); the chain entry pointing here is stale.
    Stale,
}

pub fn check<K, V>(primary: &dyn PrimaryStore<K, V>, address: Address) -> Liveness<K, V> {
    let Some(candidate) = primary.read_at_address(address) else {
        return Liveness::Stale;
    };
    let current = primary.lookup_address_for_key(&candidate.key);
    if current != address {
        return Liveness::Stale;
    }
    if candidate.is_tombstone {
        return Liveness::Deleted;
    }
    Liveness::Live(candidate.key, candidate.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primary::PrimaryRecord;
    use std::collections::HashMap;
    use std::sync::RwLock;

    struct FakePrimary {
        by_address: RwLock<HashMap<Address, PrimaryRecord<u64, String>>>,
        current_for_key: RwLock<HashMap<u64, Address>>,
    }

    impl PrimaryStore<u64, String> for FakePrimary {
        fn read(&self, key: &u64) -> Option<(Address, PrimaryRecord<u64, String>)> {
            let address = *self.current_for_key.read().unwrap().get(key)?;
            self.by_address
                .read()
                .unwrap()
                .get(&address)
                .cloned()
                .map(|r| (address, r))
        }

        fn read_at_address(&self, address: Address) -> Option<PrimaryRecord<u64, String>> {
            self.by_address.read().unwrap().get(&address).cloned()
        }

        fn lookup_address_for_key(&self, key: &u64) -> Address {
            *self
                .current_for_key
                .read()
                .unwrap()
                .get(key)
                .unwrap_or(&Address::INVALID)
        }

        fn complete_pending(&self, _blocking: bool) {}
    }

    fn fixture() -> FakePrimary {
        FakePrimary {
            by_address: RwLock::new(HashMap::new()),
            current_for_key: RwLock::new(HashMap::new()),
        }
    }

    #[test]
    fn current_address_is_live() {
        let primary = fixture();
        let addr = Address::new(10);
        primary.by_address.write().unwrap().insert(
            addr,
            PrimaryRecord {
                key: 1,
                value: "a".to_string(),
                is_tombstone: false,
            },
        );
        primary.current_for_key.write().unwrap().insert(1, addr);
        assert_eq!(check(&primary, addr), Liveness::Live(1, "a".to_string()));
    }

    #[test]
    fn superseded_address_is_stale() {
        let primary = fixture();
        let old = Address::new(10);
        let new = Address::new(20);
        primary.by_address.write().unwrap().insert(
            old,
            PrimaryRecord {
                key: 1,
                value: "old".to_string(),
                is_tombstone: false,
            },
        );
        primary.by_address.write().unwrap().insert(
            new,
            PrimaryRecord {
                key: 1,
                value: "new".to_string(),
                is_tombstone: false,
            },
        );
        primary.current_for_key.write().unwrap().insert(1, new);
        assert_eq!(check(&primary, old), Liveness::Stale);
        assert_eq!(check(&primary, new), Liveness::Live(1, "new".to_string()));
    }

    #[test]
    fn reclaimed_address_is_stale() {
        let primary = fixture();
        assert_eq!(check(&primary, Address::new(999)), Liveness::Stale);
    }

    #[test]
    fn tombstoned_current_address_is_deleted() {
        let primary = fixture();
        let addr = Address::new(10);
        primary.by_address.write().unwrap().insert(
            addr,
            PrimaryRecord {
                key: 1,
                value: String::new(),
                is_tombstone: true,
            },
        );
        primary.current_for_key.write().unwrap().insert(1, addr);
        assert_eq!(check(&primary, addr), Liveness::Deleted);
    }
}
