// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Predicates and predicate groups (§4.6): a named key-extraction function
//! over `(K, V)`, grouped with its siblings into one `PredicateGroup` that
//! shares a single secondary log store and composite-key layout.

use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::key_layout::SecondaryKey;
use crate::log_store::{LogStore, LogStoreOptions, PredicateGroupId};

/// A single named predicate: extracts an optional secondary key from a
/// primary `(K, V)` pair. Returning `None` means this predicate doesn't
/// apply to the record, which yields a null slot at this predicate's
/// ordinal (§4.1's null-slot case).
#[derive(Clone)]
pub struct Predicate<K, V, SK> {
    name: String,
    ordinal: u8,
    extract: Arc<dyn Fn(&K, &V) -> Option<SK> + Send + Sync>,
}

impl<K, V, SK> fmt::Debug for Predicate<K, V, SK> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate")
            .field("name", &self.name)
            .field("ordinal", &self.ordinal)
            .finish_non_exhaustive()
    }
}

impl<K, V, SK: SecondaryKey> Predicate<K, V, SK> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }

    pub fn extract(&self, key: &K, value: &V) -> Option<SK> {
        (self.extract)(key, value)
    }
}

/// A predicate's name and extraction function, as supplied at registration
/// time; [`crate::index_manager::IndexManager`] assigns the ordinal.
pub struct PredicateSpec<K, V, SK> {
    pub name: String,
    pub extract: Arc<dyn Fn(&K, &V) -> Option<SK> + Send + Sync>,
}

impl<K, V, SK> PredicateSpec<K, V, SK> {
    pub fn new(name: impl Into<String>, extract: impl Fn(&K, &V) -> Option<SK> + Send + Sync + 'static) -> Self {
        PredicateSpec {
            name: name.into(),
            extract: Arc::new(extract),
        }
    }
}

/// A group of predicates sharing one composite-key layout and one secondary
/// log store. Every predicate in a group is evaluated together on every
/// write, producing one `CompositeKey<SK>` with `|P|` slots (§3).
pub struct PredicateGroup<K, V, SK> {
    id: PredicateGroupId,
    predicates: Vec<Predicate<K, V, SK>>,
    store: Arc<LogStore<SK>>,
}

impl<K, V, SK: SecondaryKey> PredicateGroup<K, V, SK> {
    pub fn new(
        id: PredicateGroupId,
        specs: Vec<PredicateSpec<K, V, SK>>,
        options: LogStoreOptions,
    ) -> Result<Self, Error> {
        if specs.is_empty() {
            return Err(Error::EmptyRegistration);
        }
        let mut seen_names = std::collections::HashSet::new();
        for spec in &specs {
            if !seen_names.insert(spec.name.clone()) {
                return Err(Error::DuplicatePredicateName(spec.name.clone()));
            }
        }
        let predicates = specs
            .into_iter()
            .enumerate()
            .map(|(ordinal, spec)| Predicate {
                name: spec.name,
                ordinal: ordinal as u8,
                extract: spec.extract,
            })
            .collect::<Vec<_>>();
        let store = Arc::new(LogStore::new(options, predicates.len())?);
        Ok(PredicateGroup { id, predicates, store })
    }

    pub fn id(&self) -> PredicateGroupId {
        self.id
    }

    pub fn predicates(&self) -> &[Predicate<K, V, SK>] {
        &self.predicates
    }

    pub fn predicate_named(&self, name: &str) -> Option<&Predicate<K, V, SK>> {
        self.predicates.iter().find(|p| p.name() == name)
    }

    pub fn store(&self) -> &Arc<LogStore<SK>> {
        &self.store
    }

    pub fn num_predicates(&self) -> usize {
        self.predicates.len()
    }
}
