// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Change classification for the write path (§4.7): given a primary write,
//! decide what, if anything, the secondary index needs to do about it.
//!
//! A write to the primary store only ever needs one of four secondary-side
//! reactions:
//!
//! - [`UpdateOp::Insert`] — a brand new key. Splice a fresh composite-key
//!   record reflecting every predicate's current extraction.
//! - [`UpdateOp::Rcu`] — an existing key updated via read-copy-update (a new
//!   primary address). Splice a fresh record for the new composite; the
//!   chain entries pointing at the old address become stale and are
//!   filtered out by [`crate::liveness`] the next time a query reaches them,
//!   with no explicit unlink required.
//! - [`UpdateOp::Ipu`] — an existing key updated in place (the primary
//!   address is unchanged). Valid only when the composite key is unchanged;
//!   an in-place update that would change an indexed field is an invariant
//!   violation, since it would leave an existing secondary record's extracted
//!   key silently wrong with no new record spliced to correct it.
//! - [`UpdateOp::Delete`] — the key is gone. No *new* composite key is
//!   spliced (there's nothing left to extract), but every predicate that
//!   matched the before-image still has a live chain entry pointing at the
//!   deleted key's old address, and liveness filtering alone can't always
//!   reach it before a query sees it (§4.6/§4.7): a tombstone record carrying
//!   the before-image, `isDeleted` set on every present slot, must be
//!   spliced so those chain entries resolve to a record the read path can
//!   recognize and drop. See [`Self::needs_tombstone`].

use crate::error::Error;
use crate::key_layout::{CompositeKey, SecondaryKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Insert,
    Ipu,
    Rcu,
    Delete,
}

/// The before/after composite keys a write produced, and the classified
/// operation. `before` is `None` for a brand new key.
#[derive(Debug)]
pub struct ChangeTracker<SK> {
    pub op: UpdateOp,
    pub before: Option<CompositeKey<SK>>,
    pub after: CompositeKey<SK>,
}

impl<SK: SecondaryKey> ChangeTracker<SK> {
    /// `primary_address_changed` is `true` when the write allocated a new
    /// primary address (RCU) rather than mutating the existing one in
    /// place (IPU). The primary store, not this module, knows which
    /// happened.
    pub fn classify(
        before: Option<CompositeKey<SK>>,
        after: CompositeKey<SK>,
        primary_address_changed: bool,
        is_delete: bool,
    ) -> Result<Self, Error> {
        let op = if is_delete {
            UpdateOp::Delete
        } else {
            match &before {
                None => UpdateOp::Insert,
                Some(_) if primary_address_changed => UpdateOp::Rcu,
                Some(before) => {
                    if composite_equal(before, &after) {
                        UpdateOp::Ipu
                    } else {
                        return Err(Error::invariant(
                            "in-place update changed an indexed predicate key; this write must go through RCU",
                        ));
                    }
                }
            }
        };
        Ok(ChangeTracker { op, before, after })
    }

    /// Whether this change requires splicing a new secondary record at all.
    pub fn needs_new_record(&self) -> bool {
        matches!(self.op, UpdateOp::Insert | UpdateOp::Rcu) && self.after.has_any_present()
    }

    /// Whether this delete needs to splice a tombstone record carrying the
    /// before-image, every present slot marked `isDeleted` (§4.6/§4.7). Only
    /// true when the deleted key actually matched at least one predicate —
    /// a key that extracted to all-null had nothing live to tombstone.
    pub fn needs_tombstone(&self) -> bool {
        self.op == UpdateOp::Delete && self.before.as_ref().is_some_and(CompositeKey::has_any_present)
    }
}

fn composite_equal<SK: SecondaryKey>(a: &CompositeKey<SK>, b: &CompositeKey<SK>) -> bool {
    a.slots.len() == b.slots.len()
        && a.slots
            .iter()
            .zip(b.slots.iter())
            .all(|(x, y)| x.is_null == y.is_null && x.key == y.key)
}
