// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Chain traversal as an async stream (§4.4), modeled on the chained-loglet
//! read streams elsewhere in this tree: walk `previousAddress` links from a
//! chain head down to the oldest entry, yielding only published records
//! whose slot actually matches the query key (the tag match that put two
//! entries in the same bucket doesn't guarantee key equality). A step that
//! lands on a reclaimed-to-disk address resolves through one simulated I/O
//! round trip and reports `Poll::Pending` for that round, matching the
//! PENDING status codes in §4.2/§4.9.
//!
//! The epoch guard protecting address translation is dropped before
//! suspending on a disk fetch and re-acquired on the next poll, so a slow
//! chain walk never holds back reclamation indefinitely (§5).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;

use crate::address::Address;
use crate::epoch::{EpochManager, OwnedEpochGuard};
use crate::error::Error;
use crate::key_accessor::{chain_hash, slot_matches, tag_of};
use crate::key_layout::{Record, SecondaryKey};
use crate::log_store::{unpack_entry, LogStore, PhysicalLookup};

type ColdFetch<SK> = Pin<Box<dyn Future<Output = Option<Arc<Record<SK>>>> + Send>>;

/// Walks one predicate's hash chain for a single query key, oldest-last.
pub struct ReadStream<SK: SecondaryKey> {
    store: Arc<LogStore<SK>>,
    epoch: Arc<EpochManager>,
    ordinal: u8,
    key: SK,
    next: Address,
    pending: Option<ColdFetch<SK>>,
    guard: Option<OwnedEpochGuard>,
}

impl<SK: SecondaryKey> ReadStream<SK> {
    pub fn new(store: Arc<LogStore<SK>>, epoch: Arc<EpochManager>, ordinal: u8, key: SK, head: Address) -> Self {
        ReadStream {
            store,
            epoch,
            ordinal,
            key,
            next: head,
            pending: None,
            guard: None,
        }
    }

    /// Looks up the chain head for `(ordinal, key)` itself, rather than
    /// requiring the caller to compute a bucket/tag by hand.
    pub fn for_predicate(store: Arc<LogStore<SK>>, epoch: Arc<EpochManager>, ordinal: u8, key: SK) -> Self {
        let hash = chain_hash(ordinal, &key);
        let bucket = store.find_or_create_bucket(hash);
        let (_, head) = unpack_entry(store.read_bucket_word(bucket));
        ReadStream::new(store, epoch, ordinal, key, head)
    }
}

impl<SK: SecondaryKey> Stream for ReadStream<SK> {
    type Item = Result<Arc<Record<SK>>, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(fut) = this.pending.as_mut() {
                match fut.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(None) => {
                        this.pending = None;
                        return Poll::Ready(Some(Err(Error::invariant("chain entry vanished from disk during read"))));
                    }
                    Poll::Ready(Some(record)) => {
                        this.pending = None;
                        if let Some(matched) = this.advance_and_filter(&record) {
                            return Poll::Ready(Some(Ok(matched)));
                        }
                        // didn't match or wasn't published; fall through and
                        // keep walking the chain from the new `next`.
                    }
                }
            }

            if this.guard.is_none() {
                this.guard = Some(this.epoch.protect_owned());
            }

            if !this.next.is_valid() || this.next < this.store.begin_address() {
                this.guard = None;
                return Poll::Ready(None);
            }

            match this.store.physical_address(this.next) {
                PhysicalLookup::InMemory(record) => {
                    if let Some(matched) = this.advance_and_filter(&record) {
                        return Poll::Ready(Some(Ok(matched)));
                    }
                    // didn't match or wasn't published yet; loop around and
                    // keep walking the chain from the new `next`.
                }
                PhysicalLookup::OnDisk => {
                    this.guard = None;
                    let store = this.store.clone();
                    let address = this.next;
                    this.pending = Some(Box::pin(async move { store.fetch_cold(address).await }));
                    // loop back around so the pending-poll branch above
                    // polls the freshly created future at least once,
                    // registering a waker rather than stalling forever.
                }
                PhysicalLookup::BelowBegin => {
                    this.guard = None;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl<SK: SecondaryKey> ReadStream<SK> {
    /// Advances `next` to this record's predecessor and returns the record
    /// if it's published and actually matches the query key.
    fn advance_and_filter(&mut self, record: &Arc<Record<SK>>) -> Option<Arc<Record<SK>>> {
        let slot = &record.composite.slots[self.ordinal as usize];
        self.next = slot.previous_address.load();
        if !record.info.is_invalid() && slot_matches(slot, self.ordinal, &self.key) {
            Some(record.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use tracing_test::traced_test;

    use super::*;
    use crate::insert_engine::insert;
    use crate::key_layout::{CompositeKey, KeyPointer};
    use crate::log_store::LogStoreOptions;
    use futures::StreamExt;

    fn slot(key: u64) -> CompositeKey<u64> {
        CompositeKey {
            slots: vec![KeyPointer::present(0, key)],
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn yields_matching_records_newest_first() {
        let store = Arc::new(LogStore::<u64>::new(LogStoreOptions::default(), 1).unwrap());
        let epoch = Arc::new(EpochManager::new());
        let a1 = insert(&store, &epoch, slot(7), Address::new(100), false, 1).unwrap();
        insert(&store, &epoch, slot(9), Address::new(200), false, 1).unwrap();
        insert(&store, &epoch, slot(7), Address::new(300), false, 1).unwrap();

        let stream = ReadStream::for_predicate(store.clone(), epoch.clone(), 0, 7u64);
        let results: Vec<_> = stream.map(|r| r.unwrap()).collect().await;
        assert_that!(
            results.iter().map(|r| r.primary_address).collect::<Vec<_>>(),
            elements_are![eq(Address::new(300)), eq(Address::new(100))]
        );
        assert_eq!(results[0].composite.slots[0].previous_address.load(), a1);
    }

    #[tokio::test]
    async fn empty_chain_yields_nothing() {
        let store = Arc::new(LogStore::<u64>::new(LogStoreOptions::default(), 1).unwrap());
        let epoch = Arc::new(EpochManager::new());
        let stream = ReadStream::for_predicate(store, epoch, 0, 123u64);
        let results: Vec<_> = stream.collect().await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn chain_read_resumes_across_a_disk_round_trip() {
        let store = Arc::new(LogStore::<u64>::new(LogStoreOptions::default(), 1).unwrap());
        let epoch = Arc::new(EpochManager::new());
        let a1 = insert(&store, &epoch, slot(5), Address::new(10), false, 1).unwrap();
        insert(&store, &epoch, slot(5), Address::new(20), false, 1).unwrap();

        // evict the older record to the cold side table.
        store.flush_and_evict(a1.next());

        let stream = ReadStream::for_predicate(store.clone(), epoch.clone(), 0, 5u64);
        let results: Vec<_> = stream.map(|r| r.unwrap()).collect().await;
        assert_that!(
            results.iter().map(|r| r.primary_address).collect::<Vec<_>>(),
            elements_are![eq(Address::new(20)), eq(Address::new(10))]
        );
    }
}
