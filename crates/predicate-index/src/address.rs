// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::atomic::{AtomicU64, Ordering};

/// A logical address, shared meaning between the primary store (where it
/// identifies a specific record version) and the secondary log store
/// (where it addresses a composite-key record or a slot inside one).
///
/// `Address(0)` is reserved as `INVALID`: a bucket entry or `previousAddress`
/// carrying it means "no predecessor".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub struct Address(u64);

impl Address {
    pub const INVALID: Address = Address(0);
    pub const OLDEST: Address = Address(1);

    pub const fn new(value: u64) -> Self {
        Address(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    pub fn next(self) -> Self {
        Address(self.0 + 1)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address(value)
    }
}

impl From<Address> for u64 {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// An [`Address`] that can be mutated in place behind a shared reference.
/// [`crate::insert_engine::insert`] needs this: a slot's `previousAddress`
/// may be re-targeted (linking below a CAS race loser, §4.3 step 4) after
/// the record has already been written into `LogStore::hot` and is only
/// reachable through an `Arc<Record<SK>>`.
#[derive(Debug, Default)]
pub struct AtomicAddress(AtomicU64);

impl AtomicAddress {
    pub fn new(address: Address) -> Self {
        AtomicAddress(AtomicU64::new(address.get()))
    }

    pub fn load(&self) -> Address {
        Address::new(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, address: Address) {
        self.0.store(address.get(), Ordering::Release);
    }
}

impl Clone for AtomicAddress {
    fn clone(&self) -> Self {
        AtomicAddress::new(self.load())
    }
}

/// A monotonically increasing address cursor used to hand out tail
/// addresses for the secondary log's bump allocator.
#[derive(Debug, Default)]
pub struct AddressCursor(AtomicU64);

impl AddressCursor {
    pub fn starting_at(address: Address) -> Self {
        AddressCursor(AtomicU64::new(address.get()))
    }

    /// Reserves and returns the next address, advancing the cursor by one.
    pub fn allocate(&self) -> Address {
        Address::new(self.0.fetch_add(1, Ordering::AcqRel))
    }

    pub fn current(&self) -> Address {
        Address::new(self.0.load(Ordering::Acquire))
    }

    /// Used by recovery to restore a cursor to a checkpointed tail.
    pub fn reset_to(&self, address: Address) {
        self.0.store(address.get(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_not_valid() {
        assert!(!Address::INVALID.is_valid());
        assert!(Address::OLDEST.is_valid());
    }

    #[test]
    fn cursor_allocates_monotonically() {
        let cursor = AddressCursor::starting_at(Address::OLDEST);
        let a = cursor.allocate();
        let b = cursor.allocate();
        assert!(a < b);
        assert_eq!(cursor.current(), b.next());
    }

    #[test]
    fn atomic_address_stores_and_clones_by_value() {
        let a = AtomicAddress::new(Address::new(5));
        a.store(Address::new(9));
        let cloned = a.clone();
        assert_eq!(cloned.load(), Address::new(9));
        cloned.store(Address::new(1));
        assert_eq!(a.load(), Address::new(9), "clone must not alias the original");
    }
}
