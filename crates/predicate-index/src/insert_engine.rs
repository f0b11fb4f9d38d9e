// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The lock-free insert path (§4.3): splice a freshly-allocated composite-key
//! record onto every predicate chain it belongs to.
//!
//! The record is fully written — every slot's `previousAddress` resolved
//! from a pre-scan of the relevant bucket heads — *before* any bucket is
//! touched, so the address is never reachable from a chain with a dangling
//! or half-built record behind it. Splicing is then one CAS attempt per
//! chain. A chain whose CAS loses the race doesn't necessarily abort the
//! whole insert (§4.3 step 4): if the bucket's current entry still has a
//! *lower* address than the one we're splicing in, the downward-chain
//! invariant survives — we re-target that slot's `previousAddress` to the
//! new entry, link below it, and retry the CAS on that chain alone. Only a
//! genuine upward link (the bucket now points at something with a *higher*
//! address than ours, meaning a concurrent insert finished its own splice
//! after our pre-scan but allocated before us) can't be resolved locally;
//! that aborts the whole insert with `Error::RetryNow`, leaving the record
//! abandoned in the hot region — forever invalid, and for any chain it did
//! reach, permanently but harmlessly linked — the same kind of hole a
//! reclaimed log leaves behind. The caller re-drives from scratch with a
//! fresh pre-scan.
//!
//! A record becomes visible to *any* reader only once
//! [`crate::key_layout::RecordInfo::publish`] clears its invalid bit, so the
//! handful of instructions between "spliced onto predicate A" and "spliced
//! onto predicate B" never produces a torn read — readers on either chain
//! see the record consistently absent until publish, then consistently
//! present.
//!
//! `Error::CprShift` covers the cheaper case: the store had already moved to
//! a new checkpoint version before this insert even began its pre-scan, so
//! the caller should refresh its session version and retry without having
//! written anything. A second version check right before publish catches a
//! checkpoint that lands mid-splice and folds it into the same `RetryNow`
//! path.

use crate::address::Address;
use crate::epoch::EpochManager;
use crate::error::Error;
use crate::key_accessor::{chain_hash, tag_of};
use crate::key_layout::{CompositeKey, KeyPointer, Record, RecordInfo, SecondaryKey};
use crate::log_store::{pack_entry, unpack_entry, LogStore};

/// Splices `composite` onto every chain its non-null slots belong to and
/// returns the address of the new record.
///
/// `composite`'s slots must already carry the correct `ordinal`/`key`/
/// `is_null` values (the caller, [`crate::predicate_group::PredicateGroup`],
/// is responsible for running each predicate's extractor); `previous_address`
/// on each slot is overwritten here during the splice.
pub fn insert<SK: SecondaryKey>(
    store: &LogStore<SK>,
    epoch: &EpochManager,
    mut composite: CompositeKey<SK>,
    primary_address: Address,
    is_delete: bool,
    session_version: u32,
) -> Result<Address, Error> {
    if session_version != store.current_version() {
        return Err(Error::CprShift);
    }

    let _guard = epoch.protect();

    // Pre-scan: read every chain head this record will join *before*
    // allocating, so the record we write carries its final previousAddress
    // values and never exists, even transiently, with a dangling pointer.
    let targets: Vec<(usize, u16, u64, Address, u8)> = composite
        .slots
        .iter()
        .filter(|s| !s.is_null)
        .map(|slot| {
            let key = slot.key.as_ref().expect("present slot carries a key");
            let hash = chain_hash(slot.ordinal, key);
            let tag = tag_of(hash);
            let bucket = store.find_or_create_bucket(hash);
            let expected_word = store.read_bucket_word(bucket);
            let (_, head) = unpack_entry(expected_word);
            (bucket, tag, expected_word, head, slot.ordinal)
        })
        .collect();

    for (slot, (_, _, _, head, _)) in composite
        .slots
        .iter_mut()
        .filter(|s| !s.is_null)
        .zip(targets.iter())
    {
        slot.previous_address.store(*head);
    }

    let address = store.block_allocate();
    let record = Record {
        info: RecordInfo::new_invalid(session_version, is_delete),
        composite,
        primary_address,
    };
    store.write_record(address, record);

    // Splice: one CAS attempt per chain, retried in place while the
    // downward invariant still holds (§4.3 step 4). The record is already
    // visible through `store.get_record` (just not yet published), so a
    // losing CAS can re-target that chain's slot to link below the winner
    // rather than abandoning the whole insert.
    let spliced = store.get_record(address).expect("record just written");
    for (bucket, tag, expected_word, _, ordinal) in &targets {
        let mut expected_word = *expected_word;
        loop {
            let desired_word = pack_entry(*tag, address);
            match store.cas_bucket_entry(*bucket, expected_word, desired_word) {
                Ok(_) => break,
                Err(actual_word) => {
                    let (_, actual_head) = unpack_entry(actual_word);
                    if actual_head < address {
                        spliced.composite.slots[*ordinal as usize]
                            .previous_address
                            .store(actual_head);
                        expected_word = actual_word;
                        continue;
                    }
                    return Err(Error::RetryNow);
                }
            }
        }
    }

    if session_version != store.current_version() {
        return Err(Error::RetryNow);
    }

    spliced.info.publish();

    Ok(address)
}
