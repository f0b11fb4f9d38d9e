// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Byte-level layout of composite-key records: a `RecordInfo` header
//! followed by one `KeyPointer` slot per predicate, followed by the
//! primary address. See §3 and §4.1 of the design.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::address::{Address, AtomicAddress};

/// Inline capacity, in bytes, for a secondary key stored directly in a
/// `KeyPointer` slot. Keys that encode to more than this spill to the
/// record's out-of-line overflow trailer (see [`Record::to_bytes`]) and
/// the slot carries `is_out_of_line_key = true` instead, with its inline
/// bytes left unused. Chosen to cover the common case (fixed-width
/// scalars, short strings) inline while keeping `slotSize` constant
/// across a group, per the layout invariant in spec §3.
pub const INLINE_KEY_CAPACITY: usize = 24;

/// Fixed per-slot byte width: previousAddress(8) + offsetToStartOfKeys(2)
/// + ordinal(1) + flags(1) + keyLen(2) + inline key bytes.
pub const SLOT_SIZE: usize = 8 + 2 + 1 + 1 + 2 + INLINE_KEY_CAPACITY;

const FLAG_IS_NULL: u8 = 1 << 0;
const FLAG_IS_DELETED: u8 = 1 << 1;
const FLAG_IS_UNLINK_OLD: u8 = 1 << 2;
const FLAG_IS_LINK_NEW: u8 = 1 << 3;
const FLAG_IS_OUT_OF_LINE_KEY: u8 = 1 << 4;

/// A secondary key type. All predicates in one `PredicateGroup` share one
/// `SK`, per the group invariant in spec §3.
pub trait SecondaryKey: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static {
    fn encode(&self) -> Bytes;
    fn decode(bytes: &[u8]) -> Self;
}

impl SecondaryKey for u64 {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.to_be_bytes())
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut buf = bytes;
        buf.get_u64()
    }
}

impl SecondaryKey for i64 {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.to_be_bytes())
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut buf = bytes;
        buf.get_i64()
    }
}

impl SecondaryKey for String {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }

    fn decode(bytes: &[u8]) -> Self {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// One predicate's entry inside a composite key: the chain back-pointer,
/// flags, and (inline or out-of-line) key bytes.
#[derive(Debug, Clone)]
pub struct KeyPointer<SK> {
    pub previous_address: AtomicAddress,
    pub offset_to_start_of_keys: u16,
    pub ordinal: u8,
    pub is_null: bool,
    pub is_deleted: bool,
    pub is_unlink_old: bool,
    pub is_link_new: bool,
    pub is_out_of_line_key: bool,
    pub key: Option<SK>,
}

impl<SK: SecondaryKey> KeyPointer<SK> {
    pub fn null(ordinal: u8) -> Self {
        KeyPointer {
            previous_address: AtomicAddress::new(Address::INVALID),
            offset_to_start_of_keys: (ordinal as usize * SLOT_SIZE) as u16,
            ordinal,
            is_null: true,
            is_deleted: false,
            is_unlink_old: false,
            is_link_new: false,
            is_out_of_line_key: false,
            key: None,
        }
    }

    pub fn present(ordinal: u8, key: SK) -> Self {
        let out_of_line = key.encode().len() > INLINE_KEY_CAPACITY;
        KeyPointer {
            previous_address: AtomicAddress::new(Address::INVALID),
            offset_to_start_of_keys: (ordinal as usize * SLOT_SIZE) as u16,
            ordinal,
            is_null: false,
            is_deleted: false,
            is_unlink_old: false,
            is_link_new: false,
            is_out_of_line_key: out_of_line,
            key: Some(key),
        }
    }

    fn flags(&self) -> u8 {
        let mut f = 0u8;
        if self.is_null {
            f |= FLAG_IS_NULL;
        }
        if self.is_deleted {
            f |= FLAG_IS_DELETED;
        }
        if self.is_unlink_old {
            f |= FLAG_IS_UNLINK_OLD;
        }
        if self.is_link_new {
            f |= FLAG_IS_LINK_NEW;
        }
        if self.is_out_of_line_key {
            f |= FLAG_IS_OUT_OF_LINE_KEY;
        }
        f
    }

    /// Encodes this slot's fixed-width portion into `buf`. A key too large
    /// for `INLINE_KEY_CAPACITY` is written length-prefixed into `overflow`
    /// instead (in slot order, so [`Self::decode`] can pull entries off a
    /// matching `overflow` cursor in the same order); the inline bytes are
    /// left zeroed rather than holding a truncated, unusable prefix.
    pub(crate) fn encode(&self, buf: &mut BytesMut, overflow: &mut BytesMut) {
        buf.put_u64(self.previous_address.load().get());
        buf.put_u16(self.offset_to_start_of_keys);
        buf.put_u8(self.ordinal);
        buf.put_u8(self.flags());
        let encoded = self.key.as_ref().map(SecondaryKey::encode).unwrap_or_default();
        if self.is_out_of_line_key {
            buf.put_u16(0);
            buf.put_slice(&[0u8; INLINE_KEY_CAPACITY]);
            overflow.put_u32(encoded.len() as u32);
            overflow.put_slice(&encoded);
        } else {
            buf.put_u16(encoded.len() as u16);
            let mut inline = [0u8; INLINE_KEY_CAPACITY];
            inline[..encoded.len()].copy_from_slice(&encoded);
            buf.put_slice(&inline);
        }
    }

    /// Decodes one slot from its fixed-width region, pulling the full key
    /// out of `overflow` when `is_out_of_line_key` is set. `overflow` must
    /// be positioned at this slot's entry — i.e. every other slot in the
    /// same composite key must have been decoded first, in order.
    pub(crate) fn decode(mut buf: &[u8], overflow: &mut Bytes) -> Self {
        let previous_address = Address::new(buf.get_u64());
        let offset_to_start_of_keys = buf.get_u16();
        let ordinal = buf.get_u8();
        let flags = buf.get_u8();
        let key_len = buf.get_u16() as usize;
        let inline = &buf[..INLINE_KEY_CAPACITY];
        let is_null = flags & FLAG_IS_NULL != 0;
        let is_out_of_line_key = flags & FLAG_IS_OUT_OF_LINE_KEY != 0;
        let key = if is_null {
            None
        } else if is_out_of_line_key {
            let len = overflow.get_u32() as usize;
            Some(SK::decode(&overflow.split_to(len)))
        } else {
            Some(SK::decode(&inline[..key_len]))
        };
        KeyPointer {
            previous_address: AtomicAddress::new(previous_address),
            offset_to_start_of_keys,
            ordinal,
            is_null,
            is_deleted: flags & FLAG_IS_DELETED != 0,
            is_unlink_old: flags & FLAG_IS_UNLINK_OLD != 0,
            is_link_new: flags & FLAG_IS_LINK_NEW != 0,
            is_out_of_line_key,
            key,
        }
    }
}

/// The in-record sequence of `|P|` slots, one per predicate ordinal.
#[derive(Debug, Clone)]
pub struct CompositeKey<SK> {
    pub slots: Vec<KeyPointer<SK>>,
}

impl<SK: SecondaryKey> CompositeKey<SK> {
    pub fn all_null(num_predicates: usize) -> Self {
        CompositeKey {
            slots: (0..num_predicates)
                .map(|i| KeyPointer::null(i as u8))
                .collect(),
        }
    }

    pub fn has_any_present(&self) -> bool {
        self.slots.iter().any(|s| !s.is_null)
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut, overflow: &mut BytesMut) {
        for slot in &self.slots {
            slot.encode(buf, overflow);
        }
    }

    pub(crate) fn decode(buf: &[u8], num_predicates: usize, overflow: &mut Bytes) -> Self {
        let slots = (0..num_predicates)
            .map(|i| KeyPointer::decode(&buf[i * SLOT_SIZE..(i + 1) * SLOT_SIZE], overflow))
            .collect();
        CompositeKey { slots }
    }
}

const INVALID_BIT: u64 = 1 << 0;
const TOMBSTONE_BIT: u64 = 1 << 1;
const FINAL_BIT: u64 = 1 << 2;
const VERSION_SHIFT: u32 = 3;

/// `RecordInfo` header: validity bit, tombstone bit, version. Packed into
/// a single `AtomicU64` so that clearing the invalid bit to publish an
/// insert (§4.3 step 5) is a single atomic release-store, visible to any
/// reader that acquire-loads the header before following a slot pointer
/// into this record.
#[derive(Debug)]
pub struct RecordInfo(AtomicU64);

impl RecordInfo {
    pub fn new_invalid(version: u32, tombstone: bool) -> Self {
        let mut word = (version as u64) << VERSION_SHIFT | INVALID_BIT | FINAL_BIT;
        if tombstone {
            word |= TOMBSTONE_BIT;
        }
        RecordInfo(AtomicU64::new(word))
    }

    pub fn is_invalid(&self) -> bool {
        self.0.load(Ordering::Acquire) & INVALID_BIT != 0
    }

    pub fn is_tombstone(&self) -> bool {
        self.0.load(Ordering::Acquire) & TOMBSTONE_BIT != 0
    }

    pub fn version(&self) -> u32 {
        (self.0.load(Ordering::Acquire) >> VERSION_SHIFT) as u32
    }

    /// Clears the invalid bit, making the record's slices visible to chain
    /// traversals. Idempotent.
    pub fn publish(&self) {
        self.0.fetch_and(!INVALID_BIT, Ordering::Release);
    }

    pub(crate) fn to_word(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn from_word(word: u64) -> Self {
        RecordInfo(AtomicU64::new(word))
    }
}

/// A composite-key record as it sits in the secondary log: header, the
/// `|P|` key-pointer slots, and the primary address it resolves to.
#[derive(Debug)]
pub struct Record<SK> {
    pub info: RecordInfo,
    pub composite: CompositeKey<SK>,
    pub primary_address: Address,
}

impl<SK: SecondaryKey> Record<SK> {
    /// Serializes this record: header, fixed-width composite-key slots,
    /// primary address, then an out-of-line overflow trailer holding the
    /// full bytes of any key too large to fit inline (§3's "out-of-line
    /// key" case).
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.composite.slots.len() * SLOT_SIZE + 8);
        let mut overflow = BytesMut::new();
        buf.put_u64(self.info.to_word());
        self.composite.encode(&mut buf, &mut overflow);
        buf.put_u64(self.primary_address.get());
        buf.unsplit(overflow);
        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8], num_predicates: usize) -> Self {
        let mut buf = bytes;
        let header_word = buf.get_u64();
        let composite_region_len = num_predicates * SLOT_SIZE;
        let composite_bytes = &buf[..composite_region_len];
        buf.advance(composite_region_len);
        let primary_address = Address::new(buf.get_u64());
        let mut overflow = Bytes::copy_from_slice(buf);
        let composite = CompositeKey::decode(composite_bytes, num_predicates, &mut overflow);
        Record {
            info: RecordInfo::from_word(header_word),
            composite,
            primary_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_round_trips_inline_key() {
        let slot = KeyPointer::present(2, 42u64);
        let mut buf = BytesMut::new();
        let mut overflow = BytesMut::new();
        slot.encode(&mut buf, &mut overflow);
        assert_eq!(buf.len(), SLOT_SIZE);
        assert!(overflow.is_empty(), "an inline key must not touch the overflow trailer");
        let mut overflow = overflow.freeze();
        let decoded = KeyPointer::<u64>::decode(&buf, &mut overflow);
        assert_eq!(decoded.ordinal, 2);
        assert!(!decoded.is_null);
        assert_eq!(decoded.key, Some(42));
    }

    #[test]
    fn null_slot_round_trips() {
        let slot = KeyPointer::<u64>::null(0);
        let mut buf = BytesMut::new();
        let mut overflow = BytesMut::new();
        slot.encode(&mut buf, &mut overflow);
        let mut overflow = overflow.freeze();
        let decoded = KeyPointer::<u64>::decode(&buf, &mut overflow);
        assert!(decoded.is_null);
        assert_eq!(decoded.key, None);
    }

    #[test]
    fn record_round_trips_through_bytes() {
        let composite = CompositeKey {
            slots: vec![
                KeyPointer::present(0, "red".to_string()),
                KeyPointer::null(1),
            ],
        };
        let record = Record {
            info: RecordInfo::new_invalid(3, false),
            composite,
            primary_address: Address::new(7),
        };
        let bytes = record.to_bytes();
        let decoded = Record::<String>::from_bytes(&bytes, 2);
        assert_eq!(decoded.primary_address, Address::new(7));
        assert_eq!(decoded.info.version(), 3);
        assert!(decoded.info.is_invalid());
        assert_eq!(decoded.composite.slots[0].key, Some("red".to_string()));
        assert!(decoded.composite.slots[1].is_null);
    }

    #[test]
    fn out_of_line_flag_set_for_long_keys() {
        let long = "x".repeat(INLINE_KEY_CAPACITY + 5);
        let slot = KeyPointer::present(0, long);
        assert!(slot.is_out_of_line_key);
    }

    #[test]
    fn out_of_line_key_round_trips_through_a_record() {
        let long = "z".repeat(INLINE_KEY_CAPACITY * 3 + 7);
        let composite = CompositeKey {
            slots: vec![KeyPointer::present(0, long.clone()), KeyPointer::null(1)],
        };
        let record = Record {
            info: RecordInfo::new_invalid(1, false),
            composite,
            primary_address: Address::new(9),
        };
        let bytes = record.to_bytes();
        let decoded = Record::<String>::from_bytes(&bytes, 2);
        assert_eq!(decoded.composite.slots[0].key, Some(long));
        assert!(decoded.composite.slots[0].is_out_of_line_key);
        assert!(decoded.composite.slots[1].is_null);
    }
}
