// Copyright (c) 2024 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end scenarios driving [`predicate_index::IndexManager`] purely
//! through its public API, backed by the `test-util` in-memory primary.

use std::collections::HashSet;
use std::sync::Arc;

use predicate_index::testutil::MockPrimary;
use predicate_index::{IndexManager, LogStoreOptions, PredicateSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Item {
    color: String,
    size: String,
}

fn item(color: &str, size: &str) -> Item {
    Item {
        color: color.to_string(),
        size: size.to_string(),
    }
}

fn new_manager() -> (IndexManager<u64, Item, String>, Arc<MockPrimary<u64, Item>>) {
    let primary = Arc::new(MockPrimary::new());
    let manager = IndexManager::new(primary.clone());
    (manager, primary)
}

fn register_color_and_size(
    manager: &IndexManager<u64, Item, String>,
) -> (predicate_index::PredicateHandle, predicate_index::PredicateHandle) {
    let (_, handles) = manager
        .register_group(
            vec![
                PredicateSpec::new("color", |_k: &u64, v: &Item| Some(v.color.clone())),
                PredicateSpec::new("size", |_k: &u64, v: &Item| Some(v.size.clone())),
            ],
            LogStoreOptions::default(),
        )
        .unwrap();
    (handles[0], handles[1])
}

fn upsert(manager: &IndexManager<u64, Item, String>, primary: &MockPrimary<u64, Item>, key: u64, value: Item) {
    let old = primary.read(&key).map(|(_, r)| r.value);
    let (address, previous) = primary.upsert(key, value.clone());
    manager.on_upsert(&key, old.as_ref(), &value, address, previous).unwrap();
}

fn keys_of(results: Vec<(u64, Item)>) -> HashSet<u64> {
    results.into_iter().map(|(k, _)| k).collect()
}

#[tokio::test]
async fn scenario_1_basic_membership() {
    let (manager, primary) = new_manager();
    let (color, size) = register_color_and_size(&manager);

    upsert(&manager, &primary, 1, item("red", "M"));
    upsert(&manager, &primary, 2, item("red", "L"));
    upsert(&manager, &primary, 3, item("blue", "M"));

    let session = manager.new_session();
    assert_eq!(
        keys_of(session.query_single(color, "red".to_string()).await.unwrap()),
        HashSet::from([1, 2])
    );
    assert_eq!(
        keys_of(session.query_single(size, "M".to_string()).await.unwrap()),
        HashSet::from([1, 3])
    );
    assert_eq!(
        keys_of(
            session
                .query_intersect((color, "red".to_string()), (size, "M".to_string()))
                .await
                .unwrap()
        ),
        HashSet::from([1])
    );
    assert_eq!(
        keys_of(
            session
                .query_union(vec![(color, "red".to_string()), (size, "M".to_string())])
                .await
                .unwrap()
        ),
        HashSet::from([1, 2, 3])
    );
}

#[tokio::test]
async fn scenario_2_rcu_preserves_queries_without_duplicates() {
    let (manager, primary) = new_manager();
    let (color, _size) = register_color_and_size(&manager);

    upsert(&manager, &primary, 1, item("red", "M"));
    upsert(&manager, &primary, 2, item("red", "L"));
    upsert(&manager, &primary, 3, item("blue", "M"));

    upsert(&manager, &primary, 2, item("blue", "L"));

    let session = manager.new_session();
    assert_eq!(
        keys_of(session.query_single(color, "red".to_string()).await.unwrap()),
        HashSet::from([1])
    );
    let blue = session.query_single(color, "blue".to_string()).await.unwrap();
    assert_eq!(keys_of(blue.clone()), HashSet::from([2, 3]));
    assert_eq!(blue.len(), 2, "record 2 must appear exactly once, not as a leftover duplicate");
}

#[tokio::test]
async fn scenario_3_delete() {
    let (manager, primary) = new_manager();
    let (color, size) = register_color_and_size(&manager);

    upsert(&manager, &primary, 1, item("red", "M"));
    upsert(&manager, &primary, 2, item("red", "L"));
    upsert(&manager, &primary, 3, item("blue", "M"));

    let old = primary.read(&1).unwrap().1.value;
    let (address, previous) = primary.delete(&1).unwrap();
    manager.on_delete(&1, &old, address, previous).unwrap();

    let session = manager.new_session();
    assert!(session.query_single(color, "red".to_string()).await.unwrap().is_empty());
    assert_eq!(
        keys_of(session.query_single(size, "M".to_string()).await.unwrap()),
        HashSet::from([3])
    );
}

#[tokio::test]
async fn scenario_4_null_extraction() {
    let primary: Arc<MockPrimary<u64, u64>> = Arc::new(MockPrimary::new());
    let manager: IndexManager<u64, u64, String> = IndexManager::new(primary.clone());
    const THRESHOLD: u64 = 100;
    let (_, handles) = manager
        .register_group(
            vec![PredicateSpec::new("bin", |_k: &u64, count: &u64| {
                (*count < THRESHOLD).then(|| (*count / 10).to_string())
            })],
            LogStoreOptions::default(),
        )
        .unwrap();
    let bin = handles[0];

    let huge: u64 = 1_000_000;
    let old = primary.read(&4).map(|(_, r)| r.value);
    let (address, previous) = primary.upsert(4, huge);
    manager.on_upsert(&4, old.as_ref(), &huge, address, previous).unwrap();

    let session = manager.new_session();
    for candidate_bin in 0..20 {
        assert!(session
            .query_single(bin, candidate_bin.to_string())
            .await
            .unwrap()
            .is_empty());
    }
}

#[tokio::test]
async fn scenario_5_vector_union() {
    let (manager, primary) = new_manager();
    let (color, _size) = register_color_and_size(&manager);

    upsert(&manager, &primary, 1, item("red", "M"));
    upsert(&manager, &primary, 2, item("red", "L"));
    upsert(&manager, &primary, 3, item("blue", "M"));
    upsert(&manager, &primary, 5, item("green", "S"));

    let session = manager.new_session();
    let results = session
        .query_union(vec![(color, "red".to_string()), (color, "blue".to_string())])
        .await
        .unwrap();
    assert_eq!(keys_of(results), HashSet::from([1, 2, 3]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_6_concurrent_inserts_all_land_exactly_once() {
    let (manager, primary) = new_manager();
    let (color, _size) = register_color_and_size(&manager);
    let manager = Arc::new(manager);

    let mut handles = Vec::new();
    for thread_idx in 0..8u64 {
        let manager = manager.clone();
        let primary = primary.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..1000u64 {
                let key = thread_idx * 1000 + i;
                let value = item("red", "M");
                let (address, previous) = primary.upsert(key, value.clone());
                manager.on_upsert(&key, None, &value, address, previous).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let session = manager.new_session();
    let results = session.query_single(color, "red".to_string()).await.unwrap();
    assert_eq!(results.len(), 8000);
    let unique_keys: HashSet<u64> = results.iter().map(|(k, _)| *k).collect();
    assert_eq!(unique_keys.len(), 8000, "every primary address must appear exactly once");
}

/// §8's liveness-filtering property under a random interleaving of inserts,
/// RCUs, and deletes against a handful of keys: after every step, a query
/// for a colour must agree exactly with whatever colour a plain in-memory
/// model says each live key currently holds.
#[tokio::test]
async fn property_query_matches_a_plain_model_under_random_updates() -> anyhow::Result<()> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let (manager, primary) = new_manager();
    let (color, _size) = register_color_and_size(&manager);
    let colors = ["red", "blue", "green"];
    let mut model: std::collections::HashMap<u64, Option<&str>> = std::collections::HashMap::new();
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);

    for _ in 0..500 {
        let key = rng.gen_range(0..10u64);
        if rng.gen_bool(0.2) {
            if model.remove(&key).flatten().is_some() {
                let old = primary.read(&key).unwrap().1.value;
                let (address, previous) = primary.delete(&key).unwrap();
                manager.on_delete(&key, &old, address, previous)?;
            }
            continue;
        }
        let picked = colors[rng.gen_range(0..colors.len())];
        upsert(&manager, &primary, key, item(picked, "M"));
        model.insert(key, Some(picked));

        for candidate in colors {
            let session = manager.new_session();
            let expected: HashSet<u64> = model
                .iter()
                .filter(|(_, c)| **c == Some(candidate))
                .map(|(k, _)| *k)
                .collect();
            let actual = keys_of(session.query_single(color, candidate.to_string()).await?);
            assert_eq!(actual, expected, "mismatch querying {candidate} for key {key}");
        }
    }
    Ok(())
}
