// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-thread epoch protocol guarding logical-address-to-physical-record
//! translation. A thread that is "in epoch" is guaranteed that any address
//! at or above the store's current `safe_read_only_address` stays resolvable
//! for the duration of the protection; `flush_and_evict` only reclaims
//! addresses below the minimum epoch any live thread is protected at.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use crossbeam_utils::CachePadded;
use dashmap::DashMap;

const UNPROTECTED: u64 = u64::MAX;

#[derive(Debug, Default)]
pub struct EpochManager {
    current: AtomicU64,
    threads: DashMap<ThreadId, CachePadded<AtomicU64>>,
}

impl EpochManager {
    pub fn new() -> Self {
        EpochManager {
            current: AtomicU64::new(1),
            threads: DashMap::new(),
        }
    }

    /// Marks the calling thread as protected at the current epoch. Returns a
    /// guard that unprotects on drop.
    #[must_use]
    pub fn protect(&self) -> EpochGuard<'_> {
        let epoch = self.current.load(Ordering::Acquire);
        self.threads
            .entry(std::thread::current().id())
            .or_insert_with(|| CachePadded::new(AtomicU64::new(UNPROTECTED)))
            .store(epoch, Ordering::Release);
        EpochGuard { manager: self }
    }

    /// Advances the global epoch by one and returns the new value.
    pub fn refresh(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Same as [`Self::protect`], but the guard owns a clone of the `Arc`
    /// rather than borrowing it — for holding protection across an `await`
    /// point inside a struct, such as [`crate::read_engine::ReadStream`],
    /// where a borrowed guard would be self-referential.
    #[must_use]
    pub fn protect_owned(self: &Arc<Self>) -> OwnedEpochGuard {
        let epoch = self.current.load(Ordering::Acquire);
        self.threads
            .entry(std::thread::current().id())
            .or_insert_with(|| CachePadded::new(AtomicU64::new(UNPROTECTED)))
            .store(epoch, Ordering::Release);
        OwnedEpochGuard { manager: self.clone() }
    }

    fn unprotect(&self) {
        if let Some(slot) = self.threads.get(&std::thread::current().id()) {
            slot.store(UNPROTECTED, Ordering::Release);
        }
    }

    /// The minimum epoch any currently-protected thread observed, i.e. the
    /// epoch below which it's safe to reclaim. Equal to the current epoch
    /// when no thread is protected.
    pub fn safe_epoch(&self) -> u64 {
        self.threads
            .iter()
            .map(|entry| entry.value().load(Ordering::Acquire))
            .filter(|&epoch| epoch != UNPROTECTED)
            .min()
            .unwrap_or_else(|| self.current.load(Ordering::Acquire))
    }
}

/// RAII epoch protection. Async query streams drop this between yielded
/// items and re-acquire on resume, so on-disk chain steps don't starve
/// reclamation (§5).
pub struct EpochGuard<'a> {
    manager: &'a EpochManager,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.manager.unprotect();
    }
}

/// The `Arc`-owning counterpart to [`EpochGuard`]. See [`EpochManager::protect_owned`].
pub struct OwnedEpochGuard {
    manager: Arc<EpochManager>,
}

impl Drop for OwnedEpochGuard {
    fn drop(&mut self) {
        self.manager.unprotect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprotected_thread_does_not_hold_back_safe_epoch() {
        let mgr = EpochManager::new();
        mgr.refresh();
        mgr.refresh();
        let expected = mgr.current.load(Ordering::Acquire);
        assert_eq!(mgr.safe_epoch(), expected);
    }

    #[test]
    fn protected_thread_pins_safe_epoch() {
        let mgr = EpochManager::new();
        let guard = mgr.protect();
        mgr.refresh();
        mgr.refresh();
        assert!(mgr.safe_epoch() < mgr.current.load(Ordering::Acquire));
        drop(guard);
        let expected = mgr.current.load(Ordering::Acquire);
        assert_eq!(mgr.safe_epoch(), expected);
    }
}
