// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Hashing and equality over the key layout: the secondary store's
//! equality/hash contract, keyed by `(predicateOrdinal, SK)`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::key_layout::{KeyPointer, SecondaryKey};

/// `H(userHash(key))`, independent of ordinal.
fn user_hash<SK: Hash>(key: &SK) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// `H(ordinal + 1)`, so ordinal 0 doesn't hash to zero and XOR with it.
fn ordinal_hash(ordinal: u8) -> u64 {
    let mut hasher = DefaultHasher::new();
    (ordinal as u64 + 1).hash(&mut hasher);
    hasher.finish()
}

/// `hash(slot) = H(userHash(slot.key)) ⊕ H(slot.ordinal + 1)`, so distinct
/// predicates extracting the same value never collide on the same chain.
pub fn chain_hash<SK: SecondaryKey>(ordinal: u8, key: &SK) -> u64 {
    user_hash(key) ^ ordinal_hash(ordinal)
}

/// The high 16 bits of the chain hash, stored alongside the bucket's
/// address entry for cheap mismatch rejection before a full key compare.
pub fn tag_of(hash: u64) -> u16 {
    (hash >> 48) as u16
}

/// Bucket index for a `hash_table_size`-entry table (must be a power of
/// two).
pub fn bucket_index(hash: u64, hash_table_size: usize) -> usize {
    debug_assert!(hash_table_size.is_power_of_two());
    (hash as usize) & (hash_table_size - 1)
}

/// Equality between a query slot and a stored slot: ordinal match plus
/// `userEq(key, key)`. Null slots never match (they never participate in
/// chain membership).
pub fn slot_matches<SK: SecondaryKey>(slot: &KeyPointer<SK>, ordinal: u8, query_key: &SK) -> bool {
    !slot.is_null && slot.ordinal == ordinal && slot.key.as_ref() == Some(query_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_value_different_ordinal_does_not_collide() {
        let h0 = chain_hash(0, &"red".to_string());
        let h1 = chain_hash(1, &"red".to_string());
        assert_ne!(h0, h1);
    }

    #[test]
    fn bucket_index_is_masked_to_table_size() {
        let idx = bucket_index(0xFFFF_FFFF_FFFF_FFFF, 16);
        assert!(idx < 16);
    }
}
