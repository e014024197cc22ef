//! Integration tests for the reconciliation engine
//!
//! Scenarios run against the in-memory store (for hand-built link
//! topologies and write counting) and against SQLite (for persistence,
//! rollback, and concurrent callers).

use chrono::Utc;
use identify_common::db::{init_database, DatabaseOptions};
use identify_common::{IdentityRecord, MergeStrategy};
use identify_server::reconcile::{Observation, Reconciler};
use identify_server::store::{MemoryStore, SqliteStore};
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;

fn obs(email: Option<&str>, phone: Option<&str>) -> Observation {
    Observation::new(email.map(str::to_string), phone.map(str::to_string)).unwrap()
}

fn record(id: i64, email: Option<&str>, phone: Option<&str>, linked_id: Option<i64>) -> IdentityRecord {
    let now = Utc::now();
    IdentityRecord {
        id,
        email: email.map(str::to_string),
        phone_number: phone.map(str::to_string),
        linked_id,
        created_at: now,
        updated_at: now,
    }
}

fn memory_engine(store: &MemoryStore, strategy: MergeStrategy) -> Reconciler {
    Reconciler::new(Arc::new(store.clone()), strategy)
}

async fn sqlite_engine(strategy: MergeStrategy) -> (TempDir, SqlitePool, Reconciler) {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("identify.db"), DatabaseOptions::default())
        .await
        .expect("Failed to initialize test database");
    let engine = Reconciler::new(Arc::new(SqliteStore::new(pool.clone())), strategy)
        .with_lock_retry_max_wait_ms(10_000);
    (dir, pool, engine)
}

async fn row_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM identities")
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn linked_id_of(pool: &SqlitePool, id: i64) -> Option<i64> {
    sqlx::query_scalar("SELECT linked_id FROM identities WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

// =============================================================================
// Core properties (SQLite)
// =============================================================================

#[tokio::test]
async fn test_no_match_creates_singleton() {
    let (_dir, pool, engine) = sqlite_engine(MergeStrategy::Transitive).await;

    let contact = engine.reconcile(&obs(Some("a@x.com"), None)).await.unwrap();

    assert_eq!(contact.emails, vec!["a@x.com"]);
    assert!(contact.phone_numbers.is_empty());
    assert!(contact.secondary_contact_ids.is_empty());
    assert_eq!(row_count(&pool).await, 1);
    assert_eq!(linked_id_of(&pool, contact.primary_contact_id).await, None);
}

#[tokio::test]
async fn test_exact_repeat_inserts_nothing() {
    let (_dir, pool, engine) = sqlite_engine(MergeStrategy::Transitive).await;
    let observation = obs(Some("a@x.com"), Some("555-1234"));

    let first = engine.reconcile(&observation).await.unwrap();
    let second = engine.reconcile(&observation).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(row_count(&pool).await, 1);
}

#[tokio::test]
async fn test_partial_new_info_appends_secondary() {
    let (_dir, pool, engine) = sqlite_engine(MergeStrategy::Transitive).await;

    let original = engine.reconcile(&obs(Some("a@x.com"), None)).await.unwrap();
    let merged = engine
        .reconcile(&obs(Some("a@x.com"), Some("555-1234")))
        .await
        .unwrap();

    assert_eq!(merged.primary_contact_id, original.primary_contact_id);
    assert_eq!(merged.emails, vec!["a@x.com"]);
    assert_eq!(merged.phone_numbers, vec!["555-1234"]);
    assert_eq!(merged.secondary_contact_ids.len(), 1);

    let secondary = merged.secondary_contact_ids[0];
    assert_eq!(linked_id_of(&pool, secondary).await, Some(original.primary_contact_id));
}

#[tokio::test]
async fn test_subset_observation_adds_nothing() {
    let (_dir, pool, engine) = sqlite_engine(MergeStrategy::Transitive).await;

    engine.reconcile(&obs(Some("a@x.com"), Some("555"))).await.unwrap();
    let by_phone = engine.reconcile(&obs(None, Some("555"))).await.unwrap();

    assert_eq!(by_phone.emails, vec!["a@x.com"]);
    assert_eq!(row_count(&pool).await, 1);
}

#[tokio::test]
async fn test_two_primaries_merge_under_older() {
    let (_dir, pool, engine) = sqlite_engine(MergeStrategy::Transitive).await;

    let george = engine.reconcile(&obs(Some("george@hillvalley.edu"), Some("919191"))).await.unwrap();
    let biff = engine.reconcile(&obs(Some("biffsucks@hillvalley.edu"), Some("717171"))).await.unwrap();

    let merged = engine
        .reconcile(&obs(Some("george@hillvalley.edu"), Some("717171")))
        .await
        .unwrap();

    assert_eq!(merged.primary_contact_id, george.primary_contact_id);
    assert_eq!(merged.emails, vec!["george@hillvalley.edu", "biffsucks@hillvalley.edu"]);
    assert_eq!(merged.phone_numbers, vec!["919191", "717171"]);
    assert_eq!(merged.secondary_contact_ids, vec![biff.primary_contact_id]);
    assert_eq!(
        linked_id_of(&pool, biff.primary_contact_id).await,
        Some(george.primary_contact_id)
    );
    assert_eq!(row_count(&pool).await, 2, "Merge must not insert a record");
}

// =============================================================================
// Election and relinking (in-memory topologies)
// =============================================================================

#[tokio::test]
async fn test_smallest_id_wins_election() {
    for strategy in [MergeStrategy::Transitive, MergeStrategy::Direct] {
        let store = MemoryStore::with_records(vec![
            record(5, Some("a@x.com"), None, None),
            record(12, None, Some("555"), None),
        ]);
        let engine = memory_engine(&store, strategy);

        let contact = engine.reconcile(&obs(Some("a@x.com"), Some("555"))).await.unwrap();

        assert_eq!(contact.primary_contact_id, 5, "strategy {}", strategy);
        assert_eq!(contact.secondary_contact_ids, vec![12]);
        assert_eq!(store.get(12).await.unwrap().linked_id, Some(5));
        assert_eq!(store.get(5).await.unwrap().linked_id, None);
    }
}

#[tokio::test]
async fn test_relink_is_idempotent() {
    let store = MemoryStore::with_records(vec![
        record(5, Some("a@x.com"), None, None),
        record(12, None, Some("555"), None),
    ]);
    let engine = memory_engine(&store, MergeStrategy::Transitive);
    let observation = obs(Some("a@x.com"), Some("555"));

    engine.reconcile(&observation).await.unwrap();
    assert_eq!(store.update_count(), 1);
    let writes = store.write_count();

    engine.reconcile(&observation).await.unwrap();
    assert_eq!(store.write_count(), writes, "Second pass must not write");
}

#[tokio::test]
async fn test_distinct_values() {
    let store = MemoryStore::with_records(vec![
        record(1, Some("a@x.com"), Some("111"), None),
        record(2, Some("a@x.com"), Some("222"), Some(1)),
        record(3, Some("b@x.com"), Some("111"), Some(1)),
        record(4, Some("a@x.com"), Some("222"), Some(1)),
    ]);
    let engine = memory_engine(&store, MergeStrategy::Transitive);

    let contact = engine.reconcile(&obs(Some("b@x.com"), None)).await.unwrap();

    assert_eq!(contact.emails, vec!["a@x.com", "b@x.com"]);
    assert_eq!(contact.phone_numbers, vec!["111", "222"]);
    assert_eq!(contact.secondary_contact_ids, vec![2, 3, 4]);
}

#[tokio::test]
async fn test_primary_values_listed_first() {
    let store = MemoryStore::with_records(vec![
        record(1, Some("zed@x.com"), Some("999"), None),
        record(2, Some("alpha@x.com"), Some("111"), Some(1)),
    ]);
    let engine = memory_engine(&store, MergeStrategy::Transitive);

    let contact = engine.reconcile(&obs(Some("alpha@x.com"), None)).await.unwrap();

    assert_eq!(contact.emails.first().map(String::as_str), Some("zed@x.com"));
    assert_eq!(contact.phone_numbers.first().map(String::as_str), Some("999"));
}

/// Two groups: {1, 2} and {3, 4}. The observation matches secondary 2 by
/// email and secondary 4 by phone; neither primary is matched directly.
fn split_groups() -> MemoryStore {
    MemoryStore::with_records(vec![
        record(1, Some("a@x.com"), Some("111"), None),
        record(2, Some("b@x.com"), Some("222"), Some(1)),
        record(3, Some("c@x.com"), Some("333"), None),
        record(4, Some("c@x.com"), Some("444"), Some(3)),
    ])
}

#[tokio::test]
async fn test_transitive_merge_pulls_in_whole_groups() {
    let store = split_groups();
    let engine = memory_engine(&store, MergeStrategy::Transitive);

    let contact = engine.reconcile(&obs(Some("b@x.com"), Some("444"))).await.unwrap();

    assert_eq!(contact.primary_contact_id, 1);
    assert_eq!(contact.emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
    assert_eq!(contact.phone_numbers, vec!["111", "222", "333", "444"]);
    assert_eq!(contact.secondary_contact_ids, vec![2, 3, 4]);

    for id in [2, 3, 4] {
        assert_eq!(store.get(id).await.unwrap().linked_id, Some(1), "record {}", id);
    }
    assert_eq!(store.insert_count(), 0);
}

#[tokio::test]
async fn test_direct_merge_only_relinks_matched_records() {
    let store = split_groups();
    let engine = memory_engine(&store, MergeStrategy::Direct);

    let contact = engine.reconcile(&obs(Some("b@x.com"), Some("444"))).await.unwrap();

    assert_eq!(contact.primary_contact_id, 2);
    assert_eq!(contact.emails, vec!["b@x.com", "c@x.com"]);
    assert_eq!(contact.phone_numbers, vec!["222", "444"]);
    assert_eq!(contact.secondary_contact_ids, vec![4]);

    assert_eq!(store.get(2).await.unwrap().linked_id, Some(1), "Primary pointer left as is");
    assert_eq!(store.get(3).await.unwrap().linked_id, None);
    assert_eq!(store.get(4).await.unwrap().linked_id, Some(2));
}

#[tokio::test]
async fn test_transitive_repairs_two_level_chain() {
    let store = MemoryStore::with_records(vec![
        record(1, Some("a@x.com"), None, None),
        record(2, Some("b@x.com"), None, Some(1)),
        record(3, Some("c@x.com"), None, Some(2)),
    ]);
    let engine = memory_engine(&store, MergeStrategy::Transitive);

    let contact = engine.reconcile(&obs(Some("c@x.com"), None)).await.unwrap();

    assert_eq!(contact.primary_contact_id, 1);
    assert_eq!(contact.secondary_contact_ids, vec![2, 3]);
    assert_eq!(store.get(3).await.unwrap().linked_id, Some(1));
}

#[tokio::test]
async fn test_lookup_does_not_write() {
    let store = split_groups();
    let engine = memory_engine(&store, MergeStrategy::Transitive);

    let contact = engine.lookup(4).await.unwrap();

    assert_eq!(contact.primary_contact_id, 3);
    assert_eq!(contact.secondary_contact_ids, vec![4]);
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn test_lookup_after_direct_merge_contains_requested_record() {
    let store = split_groups();
    let engine = memory_engine(&store, MergeStrategy::Direct);

    // Leaves 2 -> 1 in place and points 4 at 2
    let merged = engine.reconcile(&obs(Some("b@x.com"), Some("444"))).await.unwrap();

    let viewed = engine.lookup(4).await.unwrap();
    assert_eq!(viewed, merged);
    assert_eq!(viewed.primary_contact_id, 2);
    assert_eq!(viewed.secondary_contact_ids, vec![4]);
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn test_lookup_on_chain_end_contains_requested_record() {
    let store = MemoryStore::with_records(vec![
        record(1, Some("a@x.com"), None, None),
        record(2, Some("b@x.com"), None, Some(1)),
        record(3, Some("c@x.com"), None, Some(2)),
    ]);
    let engine = memory_engine(&store, MergeStrategy::Transitive);

    let contact = engine.lookup(3).await.unwrap();

    assert_eq!(contact.primary_contact_id, 2);
    assert_eq!(contact.secondary_contact_ids, vec![3]);
    assert_eq!(contact.emails, vec!["b@x.com", "c@x.com"]);
    assert_eq!(store.write_count(), 0);
}

/// Primary 1 holding `a@x.com` plus `secondaries` records linked to it, each
/// with its own phone number
fn wide_group(secondaries: i64) -> MemoryStore {
    let mut records = vec![record(1, Some("a@x.com"), None, None)];
    for id in 2..=secondaries + 1 {
        let phone = format!("555-{:04}", id);
        records.push(record(id, None, Some(phone.as_str()), Some(1)));
    }
    MemoryStore::with_records(records)
}

#[tokio::test]
async fn test_transitive_reads_do_not_grow_with_group_size() {
    let mut reads = Vec::new();

    for secondaries in [10, 50] {
        let store = wide_group(secondaries);
        let engine = memory_engine(&store, MergeStrategy::Transitive);

        let contact = engine.reconcile(&obs(Some("a@x.com"), None)).await.unwrap();

        assert_eq!(contact.secondary_contact_ids.len(), secondaries as usize);
        assert_eq!(store.write_count(), 0);
        reads.push(store.read_count());
    }

    // match lookup, one linked-records query per tree level, group load
    assert_eq!(reads, vec![4, 4]);
}

// =============================================================================
// Failure and concurrency
// =============================================================================

#[tokio::test]
async fn test_commit_failure_leaves_store_untouched() {
    let store = MemoryStore::with_records(vec![
        record(5, Some("a@x.com"), None, None),
        record(12, None, Some("555"), None),
    ]);
    let engine = memory_engine(&store, MergeStrategy::Direct);
    let before = store.records().await;

    // begin, match lookup, relink, group load; then commit fails
    store.fail_after(4);
    let err = engine
        .reconcile(&obs(Some("a@x.com"), Some("555")))
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(store.records().await, before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_email_creates_one_primary() {
    let (_dir, pool, engine) = sqlite_engine(MergeStrategy::Transitive).await;
    let engine = Arc::new(engine);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.reconcile(&obs(Some("race@x.com"), None)).await })
        })
        .collect();

    let mut primaries = Vec::new();
    for task in tasks {
        primaries.push(task.await.unwrap().unwrap().primary_contact_id);
    }

    primaries.dedup();
    assert_eq!(primaries.len(), 1, "All callers must see the same primary");
    assert_eq!(row_count(&pool).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_distinct_observations_all_land() {
    let (_dir, pool, engine) = sqlite_engine(MergeStrategy::Transitive).await;
    let engine = Arc::new(engine);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let email = format!("user{}@x.com", i);
                engine.reconcile(&obs(Some(&email), None)).await
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().expect("Reconcile should succeed after lock retries");
    }

    assert_eq!(row_count(&pool).await, 8);
}
