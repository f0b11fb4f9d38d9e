// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The primary store interface this crate consumes (§6.1): whatever
//! keeps the actual `(K, V)` records, addressed the same way the secondary
//! index addresses its own composite-key records.

use crate::address::Address;

/// A snapshot of a primary record read at a specific address: the current
/// key/value, whether the record is a tombstone, and whether this address
/// is still the *current* version for its key (used by the two-step
/// liveness check in [`crate::liveness`]).
#[derive(Debug, Clone)]
pub struct PrimaryRecord<K, V> {
    pub key: K,
    pub value: V,
    pub is_tombstone: bool,
}

/// The host store a [`crate::index_manager::IndexManager`] is layered over.
/// Implementations must guarantee that once `read_at_address` returns a
/// record for a given address, that address's bytes never change (RCU
/// always allocates a new address rather than mutating in place) — the
/// same guarantee the secondary log store gives its own records.
pub trait PrimaryStore<K, V>: Send + Sync {
    /// Reads whatever is live right now for `key`, along with the address
    /// that record lives at.
    fn read(&self, key: &K) -> Option<(Address, PrimaryRecord<K, V>)>;

    /// Reads the record physically stored at `address`, regardless of
    /// whether it's still the current version for its key. Returns `None`
    /// if the address has been reclaimed.
    fn read_at_address(&self, address: Address) -> Option<PrimaryRecord<K, V>>;

    /// The address currently holding the live version of `key`, or
    /// [`Address::INVALID`] if the key has no live record. Used by the
    /// liveness check's second step without materializing the full value.
    fn lookup_address_for_key(&self, key: &K) -> Address;

    /// Drains any outstanding pending reads this store has issued,
    /// blocking the caller if `blocking` is set. Mirrors the primary
    /// store's own completion pump (§6.1); a purely synchronous
    /// implementation (like [`crate::testutil::MockPrimary`]) can leave
    /// this empty.
    fn complete_pending(&self, blocking: bool);
}
