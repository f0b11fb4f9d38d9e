// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The public entry point (§4.8): register predicate groups, drive writes
//! through them, and open [`QuerySession`]s to read back through query
//! combinators evaluated after liveness filtering.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;

use crate::address::Address;
use crate::change_tracker::ChangeTracker;
use crate::epoch::EpochManager;
use crate::error::Error;
use crate::insert_engine::insert;
use crate::key_layout::{CompositeKey, KeyPointer, SecondaryKey};
use crate::liveness::{self, Liveness};
use crate::log_store::{LogStoreOptions, PredicateGroupId};
use crate::predicate_group::{PredicateGroup, PredicateSpec};
use crate::primary::PrimaryStore;
use crate::read_engine::ReadStream;

/// Identifies one predicate within a registered group — what a
/// [`QuerySession`] queries against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PredicateHandle {
    pub group: PredicateGroupId,
    pub ordinal: u8,
}

pub struct IndexManager<K, V, SK> {
    groups: DashMap<PredicateGroupId, Arc<PredicateGroup<K, V, SK>>>,
    next_group_id: AtomicU32,
    epoch: Arc<EpochManager>,
    primary: Arc<dyn PrimaryStore<K, V>>,
}

impl<K, V, SK> IndexManager<K, V, SK>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    SK: SecondaryKey,
{
    pub fn new(primary: Arc<dyn PrimaryStore<K, V>>) -> Self {
        IndexManager {
            groups: DashMap::new(),
            next_group_id: AtomicU32::new(1),
            epoch: Arc::new(EpochManager::new()),
            primary,
        }
    }

    /// Registers a new predicate group and returns its id alongside a
    /// handle for each predicate, in registration order.
    pub fn register_group(
        &self,
        specs: Vec<PredicateSpec<K, V, SK>>,
        options: LogStoreOptions,
    ) -> Result<(PredicateGroupId, Vec<PredicateHandle>), Error> {
        // Predicate names are unique across the whole manager, not just
        // within the group being registered (§4.8): a caller looks one up
        // by name alone via `predicate_handle`, with no group qualifier.
        for spec in &specs {
            let clash = self
                .groups
                .iter()
                .any(|entry| entry.value().predicate_named(&spec.name).is_some());
            if clash {
                return Err(Error::DuplicatePredicateName(spec.name.clone()));
            }
        }
        let id = PredicateGroupId::new(self.next_group_id.fetch_add(1, Ordering::AcqRel));
        let count = specs.len();
        let group = PredicateGroup::new(id, specs, options)?;
        let handles = (0..count as u8)
            .map(|ordinal| PredicateHandle { group: id, ordinal })
            .collect();
        self.groups.insert(id, Arc::new(group));
        Ok((id, handles))
    }

    pub fn predicate_handle(&self, group: PredicateGroupId, name: &str) -> Result<PredicateHandle, Error> {
        let group_ref = self.group(group)?;
        let predicate = group_ref
            .predicate_named(name)
            .ok_or_else(|| Error::invariant(format!("no predicate named '{name}'")))?;
        Ok(PredicateHandle {
            group: group_ref.id(),
            ordinal: predicate.ordinal(),
        })
    }

    fn group(&self, id: PredicateGroupId) -> Result<Arc<PredicateGroup<K, V, SK>>, Error> {
        self.groups.get(&id).map(|e| e.clone()).ok_or(Error::UnknownGroup(id))
    }

    /// Drives every registered group's reaction to an upsert. `old_value`
    /// is `None` for a brand new key. `address` is where the primary store
    /// just wrote the new version; `previous_address` is where the old
    /// version lived (ignored when `old_value` is `None`), and is equal to
    /// `address` itself when the primary performed an in-place update.
    pub fn on_upsert(
        &self,
        key: &K,
        old_value: Option<&V>,
        new_value: &V,
        address: Address,
        previous_address: Address,
    ) -> Result<(), Error> {
        for entry in self.groups.iter() {
            let group = entry.value().clone();
            let after = extract_composite(&group, key, new_value);
            let before = old_value.map(|v| extract_composite(&group, key, v));
            let address_changed = before.is_none() || address != previous_address;
            let tracker = ChangeTracker::classify(before, after, address_changed, false)?;
            if tracker.needs_new_record() {
                // `RetryNow`/`CprShift` are transient: another insert won the
                // splice race, or a checkpoint landed mid-insert. Both leave
                // nothing for the caller to undo (the abandoned record, if
                // any, is already a harmless hole), so re-drive here with a
                // fresh pre-scan rather than surfacing them.
                loop {
                    let version = group.store().current_version();
                    match insert(group.store(), &self.epoch, tracker.after.clone(), address, false, version) {
                        Ok(_) => break,
                        Err(Error::RetryNow) | Err(Error::CprShift) => continue,
                        Err(other) => return Err(other),
                    }
                }
            }
        }
        Ok(())
    }

    /// Drives every registered group's reaction to a delete. Unlike an
    /// upsert, there's no fresh composite key to extract — but every
    /// predicate the before-image matched still has a chain entry pointing
    /// at the deleted key, and that entry's own primary address may well
    /// still resolve as "current" by address alone if the primary store
    /// reuses or otherwise doesn't retire it. So a tombstone record
    /// carrying the before-image, every present slot marked `isDeleted`,
    /// is spliced in (`is_delete = true`) whenever
    /// [`ChangeTracker::needs_tombstone`] says there was something live to
    /// retract (§4.6/§4.7); [`QuerySession::materialize_live`] is what
    /// actually drops these entries from query results.
    pub fn on_delete(&self, key: &K, old_value: &V, address: Address, previous_address: Address) -> Result<(), Error> {
        for entry in self.groups.iter() {
            let group = entry.value().clone();
            let before = extract_composite(&group, key, old_value);
            let after = CompositeKey::all_null(group.num_predicates());
            let address_changed = address != previous_address;
            let tracker = ChangeTracker::classify(Some(before.clone()), after, address_changed, true)?;
            if tracker.needs_tombstone() {
                let mut tombstone = before;
                for slot in tombstone.slots.iter_mut() {
                    if !slot.is_null {
                        slot.is_deleted = true;
                    }
                }
                loop {
                    let version = group.store().current_version();
                    match insert(group.store(), &self.epoch, tombstone.clone(), address, true, version) {
                        Ok(_) => break,
                        Err(Error::RetryNow) | Err(Error::CprShift) => continue,
                        Err(other) => return Err(other),
                    }
                }
            }
        }
        Ok(())
    }

    pub fn new_session(&self) -> QuerySession<'_, K, V, SK> {
        QuerySession {
            manager: self,
            busy: AtomicBool::new(false),
        }
    }
}

fn extract_composite<K, V, SK: SecondaryKey>(group: &PredicateGroup<K, V, SK>, key: &K, value: &V) -> CompositeKey<SK> {
    let slots = group
        .predicates()
        .iter()
        .map(|p| match p.extract(key, value) {
            Some(k) => KeyPointer::present(p.ordinal(), k),
            None => KeyPointer::null(p.ordinal()),
        })
        .collect();
    CompositeKey { slots }
}

struct SessionGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// A single-threaded-affinity handle for running queries. Reentrant calls
/// (one in-flight query driving another on the same session) are rejected
/// with [`Error::ConcurrentSessionUse`] rather than silently interleaved.
pub struct QuerySession<'a, K, V, SK> {
    manager: &'a IndexManager<K, V, SK>,
    busy: AtomicBool,
}

impl<K, V, SK> QuerySession<'_, K, V, SK>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    SK: SecondaryKey,
{
    fn enter(&self) -> Result<SessionGuard<'_>, Error> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(Error::ConcurrentSessionUse);
        }
        Ok(SessionGuard { busy: &self.busy })
    }

    async fn materialize_live(&self, handle: PredicateHandle, key: SK) -> Result<HashMap<Address, (K, V)>, Error> {
        let group = self.manager.group(handle.group)?;
        let stream = ReadStream::for_predicate(group.store().clone(), self.manager.epoch.clone(), handle.ordinal, key);
        futures::pin_mut!(stream);
        let mut out = HashMap::new();
        let mut seen: HashSet<Address> = HashSet::new();
        while let Some(record) = stream.next().await {
            let record = record?;
            if !seen.insert(record.primary_address) {
                continue;
            }
            let slot = &record.composite.slots[handle.ordinal as usize];
            if record.info.is_tombstone() || slot.is_deleted {
                // a tombstone (or partial delete) for this primary address;
                // §4.4's "yield (primaryAddress, tombstone || isDeleted)"
                // contract — suppress rather than resolve through liveness.
                continue;
            }
            if let Liveness::Live(k, v) = liveness::check(self.manager.primary.as_ref(), record.primary_address) {
                out.insert(record.primary_address, (k, v));
            }
        }
        Ok(out)
    }

    /// All live records whose `handle` predicate extracted `key`.
    pub async fn query_single(&self, handle: PredicateHandle, key: SK) -> Result<Vec<(K, V)>, Error> {
        let _guard = self.enter()?;
        Ok(self.materialize_live(handle, key).await?.into_values().collect())
    }

    /// The union of several single-predicate queries, de-duplicated by
    /// primary address.
    pub async fn query_union(&self, queries: Vec<(PredicateHandle, SK)>) -> Result<Vec<(K, V)>, Error> {
        let _guard = self.enter()?;
        let mut merged: HashMap<Address, (K, V)> = HashMap::new();
        for (handle, key) in queries {
            for (addr, kv) in self.materialize_live(handle, key).await? {
                merged.entry(addr).or_insert(kv);
            }
        }
        Ok(merged.into_values().collect())
    }

    async fn combine_inner(
        &self,
        queries: Vec<(PredicateHandle, SK)>,
        combine: impl Fn(&[bool]) -> bool,
    ) -> Result<Vec<(K, V)>, Error> {
        let mut per_clause = Vec::with_capacity(queries.len());
        for (handle, key) in queries {
            per_clause.push(self.materialize_live(handle, key).await?);
        }
        let mut all_addresses: HashSet<Address> = HashSet::new();
        for clause in &per_clause {
            all_addresses.extend(clause.keys().copied());
        }
        let mut out = Vec::new();
        for address in all_addresses {
            let presence: Vec<bool> = per_clause.iter().map(|c| c.contains_key(&address)).collect();
            if combine(&presence) {
                let kv = per_clause
                    .iter()
                    .find_map(|c| c.get(&address))
                    .expect("address came from one of the clauses");
                out.push(kv.clone());
            }
        }
        Ok(out)
    }

    /// Generic n-way boolean combinator: `combine` receives, in query
    /// order, whether each clause matched a given address.
    pub async fn query_combine(
        &self,
        queries: Vec<(PredicateHandle, SK)>,
        combine: impl Fn(&[bool]) -> bool,
    ) -> Result<Vec<(K, V)>, Error> {
        let _guard = self.enter()?;
        self.combine_inner(queries, combine).await
    }

    pub async fn query_intersect(&self, a: (PredicateHandle, SK), b: (PredicateHandle, SK)) -> Result<Vec<(K, V)>, Error> {
        let _guard = self.enter()?;
        self.combine_inner(vec![a, b], |present| present[0] && present[1]).await
    }

    pub async fn query_intersect3(
        &self,
        a: (PredicateHandle, SK),
        b: (PredicateHandle, SK),
        c: (PredicateHandle, SK),
    ) -> Result<Vec<(K, V)>, Error> {
        let _guard = self.enter()?;
        self.combine_inner(vec![a, b, c], |present| present.iter().all(|&x| x)).await
    }
}
