// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A secondary predicate index layered over a log-structured primary
//! key-value store.
//!
//! Clients register named predicates `(K, V) -> Option<SK>` against a
//! [`PredicateGroup`](predicate_group::PredicateGroup), and later enumerate
//! every live primary record whose current value matches a predicate on a
//! given secondary key through an [`IndexManager`](index_manager::IndexManager)
//! and its [`QuerySession`](index_manager::QuerySession).

mod address;
mod change_tracker;
mod epoch;
mod error;
mod index_manager;
mod insert_engine;
mod key_accessor;
mod key_layout;
mod liveness;
mod log_store;
mod predicate_group;
mod primary;
mod read_engine;

#[cfg(feature = "test-util")]
pub mod testutil;

pub use address::Address;
pub use change_tracker::{ChangeTracker, UpdateOp};
pub use error::Error;
pub use index_manager::{IndexManager, PredicateHandle, QuerySession};
pub use key_layout::{CompositeKey, KeyPointer, SecondaryKey, INLINE_KEY_CAPACITY};
pub use log_store::{LogStoreOptions, PredicateGroupId};
pub use predicate_group::{Predicate, PredicateGroup, PredicateSpec};
pub use primary::PrimaryStore;

pub type Result<T> = std::result::Result<T, Error>;
