// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

/// Errors surfaced across the crate's public API.
///
/// `Transient` variants (`CprShift`, `RetryNow`, `Pending`) are recovered
/// internally by [`crate::insert_engine`] and [`crate::read_engine`] and
/// should never reach a caller; they're part of this enum only so that
/// internal retry loops can use `?` against the same `Result` type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("checkpoint version shift detected mid-insert, re-drive required")]
    CprShift,

    #[error("chain splice lost an upward-link race, re-drive required")]
    RetryNow,

    #[error("read is pending completion")]
    Pending,

    #[error("a predicate named '{0}' is already registered")]
    DuplicatePredicateName(String),

    #[error("read_cache is not supported on a secondary log store")]
    ReadCacheUnsupported,

    #[error("copy_reads_to_tail is not supported on a secondary log store")]
    CopyReadsToTailUnsupported,

    #[error("registration settings must not be empty")]
    EmptyRegistration,

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("invalid concurrent action on session")]
    ConcurrentSessionUse,

    #[error("secondary log store I/O error: {0}")]
    Io(String),

    #[error("unknown predicate group {0:?}")]
    UnknownGroup(crate::log_store::PredicateGroupId),
}

impl Error {
    pub fn invariant(message: impl Into<String>) -> Self {
        Error::Invariant(message.into())
    }
}
