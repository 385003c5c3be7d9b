use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use trigger_mssql::schema::{PrimaryKeyColumn, SqlDataType, TableId, TableName, TableSchema};

use crate::config::TriggerConfig;
use crate::error::TriggerResult;
use crate::store::state::{ChangeCountScope, LeaseStore};
use crate::types::{Cell, ChangeOperation, ChangeRow, LeasedChange, WorkerId};

/// Object id assigned to the simulated user table.
const MEMORY_TABLE_ID: i32 = 1;

/// One coalesced change-tracking entry for a key.
#[derive(Debug, Clone)]
struct MemChange {
    key: Vec<Cell>,
    version: i64,
    operation: ChangeOperation,
}

/// One row of the simulated lease ledger.
#[derive(Debug, Clone)]
struct LeaseRow {
    expiration: Option<Instant>,
    dequeue_count: i32,
    version: Option<i64>,
}

/// One row of the simulated worker-liveness table.
#[derive(Debug, Clone)]
struct WorkerRow {
    batch_size: i64,
    timestamp: Instant,
}

/// Snapshot of one lease row, for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseSnapshot {
    /// Whether the lease is currently held (unexpired).
    pub held: bool,
    /// Number of times the row was acquired.
    pub dequeue_count: i32,
    /// Last change version written to the row.
    pub version: Option<i64>,
}

#[derive(Debug)]
struct MemDb {
    key_columns: Arc<Vec<String>>,
    all_columns: Arc<Vec<String>>,
    database_id: i32,
    min_valid_version: i64,
    next_version: i64,
    /// Current user-table rows: non-key values by key token.
    user_rows: HashMap<String, Vec<Cell>>,
    /// Coalesced change-tracking entries by key token.
    changes: HashMap<String, MemChange>,
    /// The per-table global-state row; absent until seeded.
    global: Option<(i64, i32, i64)>,
    leases: HashMap<String, LeaseRow>,
    workers: HashMap<String, WorkerRow>,
}

/// Shared in-memory model of a change-tracked database.
///
/// Mirrors the semantics of the SQL Server coordination state for tests and
/// development: the change table coalesces to one entry per key, leases are
/// time-bounded, and the global version advances under the same covering
/// condition as the production store. Cloning shares the underlying state, so
/// several [`MemoryStore`]s over one database simulate several workers.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<MemDb>>,
}

impl MemoryDatabase {
    /// Creates a database for a table with the given key and value columns.
    pub fn new(key_columns: &[&str], value_columns: &[&str]) -> Self {
        let key_columns: Vec<String> = key_columns.iter().map(|s| s.to_string()).collect();
        let mut all_columns = key_columns.clone();
        all_columns.extend(value_columns.iter().map(|s| s.to_string()));

        Self {
            inner: Arc::new(Mutex::new(MemDb {
                key_columns: Arc::new(key_columns),
                all_columns: Arc::new(all_columns),
                database_id: 1,
                min_valid_version: 0,
                next_version: 1,
                user_rows: HashMap::new(),
                changes: HashMap::new(),
                global: None,
                leases: HashMap::new(),
                workers: HashMap::new(),
            })),
        }
    }

    /// Inserts a user-table row and records the tracked change.
    pub async fn insert(&self, key: Vec<Cell>, values: Vec<Cell>) -> i64 {
        let mut db = self.inner.lock().await;
        let version = db.bump_version();
        let token = key_token(&key);
        db.user_rows.insert(token.clone(), values);
        db.changes.insert(
            token,
            MemChange {
                key,
                version,
                operation: ChangeOperation::Insert,
            },
        );
        version
    }

    /// Updates a user-table row and records the tracked change. An update on
    /// top of an untracked or inserted row coalesces the way change tracking
    /// does.
    pub async fn update(&self, key: Vec<Cell>, values: Vec<Cell>) -> i64 {
        let mut db = self.inner.lock().await;
        let version = db.bump_version();
        let token = key_token(&key);
        db.user_rows.insert(token.clone(), values);
        let operation = match db.changes.get(&token) {
            Some(change) if change.operation == ChangeOperation::Insert => ChangeOperation::Insert,
            _ => ChangeOperation::Update,
        };
        db.changes.insert(
            token,
            MemChange {
                key,
                version,
                operation,
            },
        );
        version
    }

    /// Deletes a user-table row and records the tracked change.
    pub async fn delete(&self, key: Vec<Cell>) -> i64 {
        let mut db = self.inner.lock().await;
        let version = db.bump_version();
        let token = key_token(&key);
        db.user_rows.remove(&token);
        db.changes.insert(
            token,
            MemChange {
                key,
                version,
                operation: ChangeOperation::Delete,
            },
        );
        version
    }

    /// Simulates dropping and recreating the database: new database id, fresh
    /// change tracking, empty user table. The coordination rows survive, as
    /// they would after a restore.
    pub async fn recreate(&self, min_valid_version: i64) {
        let mut db = self.inner.lock().await;
        db.database_id += 1;
        db.min_valid_version = min_valid_version;
        db.next_version = min_valid_version + 1;
        db.user_rows.clear();
        db.changes.clear();
    }

    /// Simulates background cleanup of old change-tracking data by raising
    /// the minimum valid version.
    pub async fn set_min_valid_version(&self, version: i64) {
        self.inner.lock().await.min_valid_version = version;
    }

    /// Overwrites the wrapping processed-rows counter.
    pub async fn set_rows_processed(&self, value: i64) {
        let mut db = self.inner.lock().await;
        if let Some((_, _, rows)) = db.global.as_mut() {
            *rows = value;
        }
    }

    /// Returns the current global version number, if seeded.
    pub async fn global_version(&self) -> Option<i64> {
        self.inner.lock().await.global.map(|(version, _, _)| version)
    }

    /// Returns the wrapping processed-rows counter, if seeded.
    pub async fn rows_processed(&self) -> Option<i64> {
        self.inner.lock().await.global.map(|(_, _, rows)| rows)
    }

    /// Returns a snapshot of one lease row.
    pub async fn lease(&self, key: &[Cell]) -> Option<LeaseSnapshot> {
        let db = self.inner.lock().await;
        db.leases.get(&key_token(key)).map(|lease| LeaseSnapshot {
            held: lease
                .expiration
                .is_some_and(|expiration| expiration > Instant::now()),
            dequeue_count: lease.dequeue_count,
            version: lease.version,
        })
    }

    /// Returns the number of rows in the lease ledger.
    pub async fn lease_count(&self) -> usize {
        self.inner.lock().await.leases.len()
    }

    /// Returns the ids of workers with a liveness row.
    pub async fn worker_ids(&self) -> Vec<String> {
        let db = self.inner.lock().await;
        let mut ids: Vec<String> = db.workers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl MemDb {
    fn bump_version(&mut self) -> i64 {
        let version = self.next_version;
        self.next_version += 1;
        version
    }

    fn lease_available(&self, token: &str, change_version: i64, max_dequeue: i32, now: Instant) -> bool {
        match self.leases.get(token) {
            None => true,
            Some(lease) => {
                let expired = lease
                    .expiration
                    .is_none_or(|expiration| expiration < now);
                let newer = lease
                    .version
                    .is_none_or(|version| version < change_version);
                let not_poisoned = lease.dequeue_count < max_dequeue;
                expired && newer && not_poisoned
            }
        }
    }

    fn is_processed(&self, token: &str, change_version: i64, max_dequeue: i32) -> bool {
        match self.leases.get(token) {
            None => false,
            Some(lease) => {
                let released_covering = lease.expiration.is_none()
                    && lease.version.is_some_and(|version| version >= change_version);
                let poisoned = lease.dequeue_count >= max_dequeue;
                released_covering || poisoned
            }
        }
    }

    fn advance_if_covered(&mut self, candidate: i64, max_dequeue: i32) {
        let Some((global_version, _, _)) = self.global else {
            return;
        };

        let unprocessed = self.changes.iter().any(|(token, change)| {
            change.version > global_version
                && change.version <= candidate
                && !self.is_processed(token, change.version, max_dequeue)
        });
        if unprocessed {
            return;
        }

        if let Some((version, _, _)) = self.global.as_mut()
            && *version < candidate
        {
            *version = candidate;
        }
        self.leases
            .retain(|_, lease| lease.version.is_none_or(|version| version > candidate));
    }
}

/// In-memory implementation of [`LeaseStore`] for tests and development.
///
/// Each store instance represents one worker over a shared
/// [`MemoryDatabase`]. All state is lost when the process terminates.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    database: MemoryDatabase,
    config: TriggerConfig,
    worker_id: WorkerId,
}

impl MemoryStore {
    /// Creates a store for one worker over the shared database.
    pub fn new(database: MemoryDatabase, config: TriggerConfig, worker_id: WorkerId) -> Self {
        Self {
            database,
            config,
            worker_id,
        }
    }
}

impl LeaseStore for MemoryStore {
    async fn provision(&self) -> TriggerResult<TableSchema> {
        let mut db = self.database.inner.lock().await;
        let db = &mut *db;

        if db.global.is_none() {
            db.global = Some((db.min_valid_version, db.database_id, 0));
        }
        let worker_id = self.worker_id.as_str().to_string();
        db.workers.entry(worker_id).or_insert(WorkerRow {
            batch_size: 0,
            timestamp: Instant::now(),
        });

        let primary_key = db
            .key_columns
            .iter()
            .map(|name| PrimaryKeyColumn {
                name: name.clone(),
                data_type: SqlDataType {
                    name: "int".to_string(),
                    max_length: 4,
                    precision: 10,
                    scale: 0,
                },
            })
            .collect();

        Ok(TableSchema {
            table: TableName::new("dbo".to_string(), "memory".to_string()),
            id: TableId::new(MEMORY_TABLE_ID),
            primary_key,
            columns: db.all_columns.as_ref().clone(),
        })
    }

    async fn synchronize_version(&self) -> TriggerResult<()> {
        let mut db = self.database.inner.lock().await;
        let db = &mut *db;
        let database_id = db.database_id;
        let min_valid_version = db.min_valid_version;

        if let Some((version, stored_database_id, _)) = db.global.as_mut() {
            if *stored_database_id != database_id {
                *version = min_valid_version;
                *stored_database_id = database_id;
                db.leases.clear();
                debug!("database recreation detected, coordination state reset");
            } else if *version < min_valid_version {
                *version = min_valid_version;
            }
        }
        Ok(())
    }

    async fn fetch_batch(&self) -> TriggerResult<Vec<LeasedChange>> {
        let mut db = self.database.inner.lock().await;
        let Some((global_version, _, _)) = db.global else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let max_dequeue = self.config.max_dequeue_count as i32;

        let mut candidates: Vec<MemChange> = db
            .changes
            .iter()
            .filter(|(token, change)| {
                change.version > global_version
                    && db.lease_available(token, change.version, max_dequeue, now)
            })
            .map(|(_, change)| change.clone())
            .collect();
        candidates.sort_by_key(|change| change.version);
        candidates.truncate(self.config.batch_size as usize);

        let expiration = now + self.config.lease_duration();
        let mut batch = Vec::with_capacity(candidates.len());
        for change in candidates {
            let token = key_token(&change.key);
            let lease = db.leases.entry(token.clone()).or_insert(LeaseRow {
                expiration: None,
                dequeue_count: 0,
                version: None,
            });
            lease.expiration = Some(expiration);
            lease.dequeue_count += 1;
            lease.version = Some(change.version);

            let row = if change.operation == ChangeOperation::Delete {
                ChangeRow::new(db.key_columns.clone(), change.key.clone())
            } else {
                let mut values = change.key.clone();
                values.extend(db.user_rows.get(&token).cloned().unwrap_or_default());
                ChangeRow::new(db.all_columns.clone(), values)
            };

            batch.push(LeasedChange {
                version: change.version,
                operation: change.operation,
                key: change.key,
                row,
            });
        }

        Ok(batch)
    }

    async fn renew_leases(&self, keys: &[Vec<Cell>]) -> TriggerResult<()> {
        let mut db = self.database.inner.lock().await;
        let expiration = Instant::now() + self.config.lease_duration();
        for key in keys {
            if let Some(lease) = db.leases.get_mut(&key_token(key)) {
                lease.expiration = Some(expiration);
            }
        }
        Ok(())
    }

    async fn release_batch(&self, batch: &[LeasedChange]) -> TriggerResult<()> {
        let mut db = self.database.inner.lock().await;
        for change in batch {
            if let Some(lease) = db.leases.get_mut(&key_token(&change.key))
                && lease.version.is_none_or(|version| version <= change.version)
            {
                lease.expiration = None;
                lease.dequeue_count = 0;
                lease.version = Some(change.version);
            }
        }
        db.workers.insert(
            self.worker_id.as_str().to_string(),
            WorkerRow {
                batch_size: batch.len() as i64,
                timestamp: Instant::now(),
            },
        );
        Ok(())
    }

    async fn try_advance_version(&self, new_version: i64, rows_processed: i64) -> TriggerResult<()> {
        let mut db = self.database.inner.lock().await;
        db.advance_if_covered(new_version, self.config.max_dequeue_count as i32);
        if let Some((_, _, rows)) = db.global.as_mut() {
            *rows = if *rows > i64::MAX - rows_processed {
                rows_processed - (i64::MAX - *rows)
            } else {
                *rows + rows_processed
            };
        }
        Ok(())
    }

    async fn try_advance_tail(&self) -> TriggerResult<()> {
        let mut db = self.database.inner.lock().await;
        let max_dequeue = self.config.max_dequeue_count as i32;
        let candidate = db
            .leases
            .values()
            .filter(|lease| lease.expiration.is_none() || lease.dequeue_count >= max_dequeue)
            .filter_map(|lease| lease.version)
            .max();
        if let Some(candidate) = candidate {
            db.advance_if_covered(candidate, max_dequeue);
        }
        Ok(())
    }

    async fn refresh_worker(&self) -> TriggerResult<()> {
        let mut db = self.database.inner.lock().await;
        let now = Instant::now();
        db.workers
            .entry(self.worker_id.as_str().to_string())
            .and_modify(|row| row.timestamp = now)
            .or_insert(WorkerRow {
                batch_size: 0,
                timestamp: now,
            });
        Ok(())
    }

    async fn cleanup_stale_workers(&self) -> TriggerResult<()> {
        let mut db = self.database.inner.lock().await;
        let cutoff = Instant::now().checked_sub(self.config.cleanup_duration());
        if let Some(cutoff) = cutoff {
            db.workers.retain(|_, row| row.timestamp >= cutoff);
        }
        Ok(())
    }

    async fn retire_worker(&self) -> TriggerResult<()> {
        let mut db = self.database.inner.lock().await;
        db.workers.remove(self.worker_id.as_str());
        Ok(())
    }

    async fn change_count(&self, scope: ChangeCountScope) -> TriggerResult<i64> {
        let db = self.database.inner.lock().await;
        let count = match scope {
            ChangeCountScope::All => db.changes.len() as i64,
            ChangeCountScope::Unprocessed => {
                let global_version = db.global.map(|(version, _, _)| version).unwrap_or_default();
                let max_dequeue = self.config.max_dequeue_count as i32;
                db.changes
                    .iter()
                    .filter(|(token, change)| {
                        change.version > global_version
                            && !db.is_processed(token, change.version, max_dequeue)
                    })
                    .count() as i64
            }
        };
        Ok(count)
    }

    async fn rows_processed(&self) -> TriggerResult<i64> {
        let db = self.database.inner.lock().await;
        Ok(db.global.map(|(_, _, rows)| rows).unwrap_or_default())
    }

    async fn active_worker_count(&self, window: Duration) -> TriggerResult<i64> {
        let db = self.database.inner.lock().await;
        let cutoff = Instant::now().checked_sub(window);
        let count = db
            .workers
            .values()
            .filter(|row| cutoff.is_none_or(|cutoff| row.timestamp > cutoff))
            .count();
        Ok(count as i64)
    }
}

/// Canonical token for a primary-key tuple, used as map key.
fn key_token(key: &[Cell]) -> String {
    key.iter()
        .map(|cell| cell.to_string())
        .collect::<Vec<_>>()
        .join("\u{1}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TriggerConfig {
        TriggerConfig {
            batch_size: 10,
            max_dequeue_count: 3,
            ..Default::default()
        }
    }

    fn store(database: &MemoryDatabase) -> MemoryStore {
        MemoryStore::new(
            database.clone(),
            test_config(),
            WorkerId::new("worker-a"),
        )
    }

    #[tokio::test]
    async fn test_fetch_acquires_leases_in_version_order() {
        let database = MemoryDatabase::new(&["id"], &["name"]);
        let store = store(&database);
        store.provision().await.unwrap();

        database
            .insert(vec![Cell::I32(2)], vec![Cell::String("b".to_string())])
            .await;
        database
            .insert(vec![Cell::I32(1)], vec![Cell::String("a".to_string())])
            .await;

        let batch = store.fetch_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[0].version < batch[1].version);

        // Both rows are now leased, so a second fetch returns nothing.
        let empty = store.fetch_batch().await.unwrap();
        assert!(empty.is_empty());

        let lease = database.lease(&[Cell::I32(2)]).await.unwrap();
        assert!(lease.held);
        assert_eq!(lease.dequeue_count, 1);
    }

    #[tokio::test]
    async fn test_release_and_advance_retires_covered_rows() {
        let database = MemoryDatabase::new(&["id"], &["name"]);
        let store = store(&database);
        store.provision().await.unwrap();

        database
            .insert(vec![Cell::I32(1)], vec![Cell::String("a".to_string())])
            .await;
        let last = database
            .insert(vec![Cell::I32(2)], vec![Cell::String("b".to_string())])
            .await;

        let batch = store.fetch_batch().await.unwrap();
        store.release_batch(&batch).await.unwrap();
        store.try_advance_version(last, batch.len() as i64).await.unwrap();

        assert_eq!(database.global_version().await, Some(last));
        assert_eq!(database.rows_processed().await, Some(2));
        assert_eq!(database.lease_count().await, 0);
    }

    #[tokio::test]
    async fn test_advance_blocked_by_unprocessed_change() {
        let database = MemoryDatabase::new(&["id"], &["name"]);
        let store = store(&database);
        store.provision().await.unwrap();

        let first = database
            .insert(vec![Cell::I32(1)], vec![Cell::String("a".to_string())])
            .await;
        let second = database
            .insert(vec![Cell::I32(2)], vec![Cell::String("b".to_string())])
            .await;

        // Nothing was released, so the advance must not move the version.
        store.try_advance_version(second, 0).await.unwrap();
        assert_eq!(database.global_version().await, Some(first - 1));
    }

    #[tokio::test]
    async fn test_rows_processed_wraps_at_i64_max() {
        let database = MemoryDatabase::new(&["id"], &["name"]);
        let store = store(&database);
        store.provision().await.unwrap();
        database.set_rows_processed(i64::MAX - 5).await;

        store.try_advance_version(0, 10).await.unwrap();

        assert_eq!(database.rows_processed().await, Some(5));
    }

    #[tokio::test]
    async fn test_recreation_resets_version_and_leases() {
        let database = MemoryDatabase::new(&["id"], &["name"]);
        let store = store(&database);
        store.provision().await.unwrap();

        database
            .insert(vec![Cell::I32(1)], vec![Cell::String("a".to_string())])
            .await;
        let batch = store.fetch_batch().await.unwrap();
        assert_eq!(batch.len(), 1);

        database.recreate(100).await;
        store.synchronize_version().await.unwrap();

        assert_eq!(database.global_version().await, Some(100));
        assert_eq!(database.lease_count().await, 0);
    }

    #[tokio::test]
    async fn test_poisoned_change_skipped_and_advanced_past() {
        let database = MemoryDatabase::new(&["id"], &["name"]);
        let store = store(&database);
        store.provision().await.unwrap();

        let version = database
            .insert(vec![Cell::I32(1)], vec![Cell::String("a".to_string())])
            .await;

        // Acquire the change max_dequeue_count times without releasing.
        for attempt in 1..=3 {
            let batch = store.fetch_batch().await.unwrap();
            assert_eq!(batch.len(), 1, "attempt {attempt} should see the change");
            // Simulate the lease expiring without a release.
            let mut db = database.inner.lock().await;
            if let Some(lease) = db.leases.get_mut(&key_token(&[Cell::I32(1)])) {
                lease.expiration = Some(Instant::now() - Duration::from_secs(1));
            }
        }

        // The poison threshold is reached, so the row is never returned again.
        let batch = store.fetch_batch().await.unwrap();
        assert!(batch.is_empty());

        // The poisoned row counts as processed for version advancement.
        store.try_advance_version(version, 0).await.unwrap();
        assert_eq!(database.global_version().await, Some(version));
    }

    #[tokio::test]
    async fn test_worker_liveness_lifecycle() {
        let database = MemoryDatabase::new(&["id"], &["name"]);
        let store = store(&database);
        store.provision().await.unwrap();

        assert_eq!(database.worker_ids().await, vec!["worker-a".to_string()]);
        assert_eq!(
            store
                .active_worker_count(Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );

        store.retire_worker().await.unwrap();
        assert!(database.worker_ids().await.is_empty());
    }
}
