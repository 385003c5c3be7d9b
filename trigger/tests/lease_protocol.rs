//! Store-level tests of the lease protocol across multiple workers.

use std::time::Duration;

use tokio::time::advance;
use trigger::config::TriggerConfig;
use trigger::store::memory::{MemoryDatabase, MemoryStore};
use trigger::store::state::LeaseStore;
use trigger::types::{Cell, WorkerId};

fn config() -> TriggerConfig {
    TriggerConfig {
        batch_size: 10,
        lease_interval: 60,
        max_dequeue_count: 5,
        ..Default::default()
    }
}

fn worker(database: &MemoryDatabase, name: &str) -> MemoryStore {
    MemoryStore::new(database.clone(), config(), WorkerId::new(name))
}

#[tokio::test(start_paused = true)]
async fn concurrent_fetches_never_share_a_lease() {
    let database = MemoryDatabase::new(&["id"], &["name"]);
    let worker_a = worker(&database, "worker-a");
    let worker_b = worker(&database, "worker-b");
    worker_a.provision().await.unwrap();
    worker_b.provision().await.unwrap();

    for id in 0..5 {
        database
            .insert(vec![Cell::I32(id)], vec![Cell::String(format!("row-{id}"))])
            .await;
    }

    let batch_a = worker_a.fetch_batch().await.unwrap();
    let batch_b = worker_b.fetch_batch().await.unwrap();

    // The first fetch leased everything; the second must see nothing.
    assert_eq!(batch_a.len(), 5);
    assert!(batch_b.is_empty());
}

#[tokio::test(start_paused = true)]
async fn expired_lease_is_stolen_and_stale_release_is_rejected() {
    let database = MemoryDatabase::new(&["id"], &["name"]);
    let worker_a = worker(&database, "worker-a");
    let worker_b = worker(&database, "worker-b");
    worker_a.provision().await.unwrap();
    worker_b.provision().await.unwrap();

    let key = vec![Cell::I32(1)];
    database
        .insert(key.clone(), vec![Cell::String("v1".to_string())])
        .await;

    // Worker A acquires the change but never renews.
    let batch_a = worker_a.fetch_batch().await.unwrap();
    assert_eq!(batch_a.len(), 1);

    // The row changes again while A sits on it, so the change table now
    // carries a higher version for the same key.
    database
        .update(key.clone(), vec![Cell::String("v2".to_string())])
        .await;

    // Past the lease interval the lease is free for the taking.
    advance(Duration::from_secs(61)).await;
    let batch_b = worker_b.fetch_batch().await.unwrap();
    assert_eq!(batch_b.len(), 1);
    assert!(batch_b[0].version > batch_a[0].version);

    let lease = database.lease(&key).await.unwrap();
    assert_eq!(lease.dequeue_count, 2);
    assert_eq!(lease.version, Some(batch_b[0].version));

    // B processes and releases at the newer version.
    worker_b.release_batch(&batch_b).await.unwrap();

    // A's late release carries the older version; the guard must reject it.
    worker_a.release_batch(&batch_a).await.unwrap();

    let lease = database.lease(&key).await.unwrap();
    assert_eq!(lease.version, Some(batch_b[0].version));
    assert_eq!(lease.dequeue_count, 0);
    assert!(!lease.held);
}

#[tokio::test(start_paused = true)]
async fn renewal_extends_a_lease_past_its_original_expiry() {
    let database = MemoryDatabase::new(&["id"], &["name"]);
    let worker_a = worker(&database, "worker-a");
    let worker_b = worker(&database, "worker-b");
    worker_a.provision().await.unwrap();
    worker_b.provision().await.unwrap();

    let key = vec![Cell::I32(1)];
    database
        .insert(key.clone(), vec![Cell::String("a".to_string())])
        .await;

    let batch_a = worker_a.fetch_batch().await.unwrap();
    assert_eq!(batch_a.len(), 1);

    // Renew at half the lease interval, then step past the original expiry.
    advance(Duration::from_secs(30)).await;
    let keys: Vec<Vec<Cell>> = batch_a.iter().map(|change| change.key.clone()).collect();
    worker_a.renew_leases(&keys).await.unwrap();
    advance(Duration::from_secs(45)).await;

    // 75s after acquisition the renewed lease still holds.
    let batch_b = worker_b.fetch_batch().await.unwrap();
    assert!(batch_b.is_empty());

    let lease = database.lease(&key).await.unwrap();
    assert!(lease.held);
}
