//! In-memory implementation of the execution store
//!
//! Keeps the same index discipline a production key-value backend uses: a
//! primary record per id, a timeline ordered by creation time, and one set
//! per status. Every multi-index mutation happens under a single write
//! guard, which is the in-process equivalent of one atomic batch.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{
    ExecutionError, StoreError, TaskExecution, TaskFilter, TaskStatus, TaskStore,
    DEFAULT_LIST_LIMIT,
};

type TimelineKey = (DateTime<Utc>, Uuid);

struct Inner {
    records: HashMap<Uuid, TaskExecution>,
    timeline: BTreeSet<TimelineKey>,
    by_status: HashMap<TaskStatus, BTreeSet<TimelineKey>>,
}

impl Inner {
    fn status_index(&mut self, status: TaskStatus) -> &mut BTreeSet<TimelineKey> {
        self.by_status.entry(status).or_default()
    }

    fn move_status(
        &mut self,
        key: TimelineKey,
        from: TaskStatus,
        to: TaskStatus,
    ) {
        self.status_index(from).remove(&key);
        self.status_index(to).insert(key);
    }
}

/// In-memory execution store.
///
/// The reference implementation of [`TaskStore`]; also what the tests run
/// against.
pub struct MemoryTaskStore {
    inner: RwLock<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                timeline: BTreeSet::new(),
                by_status: HashMap::new(),
            }),
        }
    }

    /// Total number of records.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    /// Number of records currently in the given status.
    pub fn status_count(&self, status: TaskStatus) -> usize {
        self.inner
            .read()
            .by_status
            .get(&status)
            .map_or(0, BTreeSet::len)
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, mut record: TaskExecution) -> Result<(), StoreError> {
        if record.created_at == DateTime::<Utc>::UNIX_EPOCH {
            record.created_at = Utc::now();
        }
        let key = (record.created_at, record.id);
        let status = record.status;

        let mut inner = self.inner.write();
        inner.records.insert(record.id, record);
        inner.timeline.insert(key);
        inner.status_index(status).insert(key);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<TaskExecution, StoreError> {
        self.inner
            .read()
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn exists(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.inner.read().records.contains_key(&id))
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let record = inner.records.remove(&id).ok_or(StoreError::NotFound(id))?;
        let key = (record.created_at, record.id);
        inner.timeline.remove(&key);
        inner.status_index(record.status).remove(&key);
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let old_status = record.status;
        record.status = status;
        match status {
            TaskStatus::Running => record.attempted_at = Some(now),
            TaskStatus::Success | TaskStatus::Failed => record.finalized_at = Some(now),
            TaskStatus::Pending => record.retried += 1,
        }
        let key = (record.created_at, record.id);

        inner.move_status(key, old_status, status);
        Ok(())
    }

    async fn update_snoozed(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let old_status = record.status;
        record.status = TaskStatus::Pending;
        record.scheduled_at = Some(scheduled_at);
        // Re-entering PENDING normally charges a retry; the snooze credits
        // it straight back, so the record's count stays broker-observed.
        let key = (record.created_at, record.id);

        inner.move_status(key, old_status, TaskStatus::Pending);
        Ok(())
    }

    async fn add_error(&self, id: Uuid, mut error: ExecutionError) -> Result<(), StoreError> {
        if error.timestamp == DateTime::<Utc>::UNIX_EPOCH {
            error.timestamp = Utc::now();
        }
        let mut inner = self.inner.write();
        let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.errors.push(error);
        Ok(())
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<TaskExecution>, StoreError> {
        let limit = if filter.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            filter.limit
        };

        let inner = self.inner.read();
        let ids: Vec<Uuid> = if let Some(status) = filter.status {
            inner
                .by_status
                .get(&status)
                .map(|set| set.iter().rev().take(limit).map(|(_, id)| *id).collect())
                .unwrap_or_default()
        } else {
            let from = filter.from.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            let to = filter.to.unwrap_or_else(Utc::now);
            inner
                .timeline
                .range((
                    Bound::Included((from, Uuid::nil())),
                    Bound::Included((to, Uuid::max())),
                ))
                .rev()
                .take(limit)
                .map(|(_, id)| *id)
                .collect()
        };

        Ok(ids
            .into_iter()
            .filter_map(|id| inner.records.get(&id).cloned())
            .collect())
    }

    async fn most_recent(&self, limit: usize) -> Result<Vec<TaskExecution>, StoreError> {
        self.list(TaskFilter {
            limit,
            ..Default::default()
        })
        .await
    }

    async fn cleanup(&self, older_than: Duration) -> Result<(), StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|err| StoreError::Backend(err.to_string()))?;

        let mut inner = self.inner.write();
        let stale: Vec<TimelineKey> = inner
            .timeline
            .range((
                Bound::Unbounded,
                Bound::Excluded((cutoff, Uuid::max())),
            ))
            .copied()
            .collect();

        for key in stale {
            inner.timeline.remove(&key);
            if let Some(record) = inner.records.remove(&key.1) {
                inner.status_index(record.status).remove(&key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: &str) -> TaskExecution {
        let mut record = TaskExecution::new(Uuid::new_v4(), kind, serde_json::json!({ "n": 1 }));
        record.max_retries = 3;
        record
    }

    #[tokio::test]
    async fn test_create_get_exists_delete() {
        let store = MemoryTaskStore::new();
        let task = record("SortTask");
        let id = task.id;

        store.create(task).await.unwrap();
        assert!(store.exists(id).await.unwrap());

        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.task_kind, "SortTask");
        assert_eq!(fetched.status, TaskStatus::Pending);

        store.delete(id).await.unwrap();
        assert!(!store.exists(id).await.unwrap());
        assert!(matches!(
            store.get(id).await,
            Err(StoreError::NotFound(missing)) if missing == id
        ));
        assert_eq!(store.status_count(TaskStatus::Pending), 0);
    }

    #[tokio::test]
    async fn test_create_defaults_created_at() {
        let store = MemoryTaskStore::new();
        let mut task = record("SortTask");
        task.created_at = DateTime::<Utc>::UNIX_EPOCH;
        let id = task.id;

        store.create(task).await.unwrap();
        let fetched = store.get(id).await.unwrap();
        assert!(fetched.created_at > DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_status_transitions_derive_timestamps() {
        let store = MemoryTaskStore::new();
        let task = record("SortTask");
        let id = task.id;
        store.create(task).await.unwrap();

        store.update_status(id, TaskStatus::Running).await.unwrap();
        let running = store.get(id).await.unwrap();
        assert!(running.attempted_at.is_some());
        assert!(running.finalized_at.is_none());
        assert_eq!(store.status_count(TaskStatus::Running), 1);
        assert_eq!(store.status_count(TaskStatus::Pending), 0);

        store.update_status(id, TaskStatus::Success).await.unwrap();
        let done = store.get(id).await.unwrap();
        assert!(done.finalized_at.is_some());
        assert_eq!(done.retried, 0);
        assert_eq!(store.status_count(TaskStatus::Success), 1);
    }

    #[tokio::test]
    async fn test_reentering_pending_counts_a_retry() {
        let store = MemoryTaskStore::new();
        let task = record("SortTask");
        let id = task.id;
        store.create(task).await.unwrap();

        store.update_status(id, TaskStatus::Running).await.unwrap();
        store.update_status(id, TaskStatus::Pending).await.unwrap();

        let retried = store.get(id).await.unwrap();
        assert_eq!(retried.retried, 1);
        assert_eq!(retried.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_snooze_keeps_retried_and_sets_schedule() {
        let store = MemoryTaskStore::new();
        let task = record("SortTask");
        let id = task.id;
        store.create(task).await.unwrap();
        store.update_status(id, TaskStatus::Running).await.unwrap();

        let wake_at = Utc::now() + chrono::Duration::seconds(3);
        store.update_snoozed(id, wake_at).await.unwrap();

        let snoozed = store.get(id).await.unwrap();
        assert_eq!(snoozed.status, TaskStatus::Pending);
        assert_eq!(snoozed.retried, 0);
        assert_eq!(snoozed.scheduled_at, Some(wake_at));
        assert_eq!(store.status_count(TaskStatus::Pending), 1);
        assert_eq!(store.status_count(TaskStatus::Running), 0);
    }

    #[tokio::test]
    async fn test_add_error_appends() {
        let store = MemoryTaskStore::new();
        let task = record("SortTask");
        let id = task.id;
        store.create(task).await.unwrap();

        store
            .add_error(id, ExecutionError::new("first failure"))
            .await
            .unwrap();
        store
            .add_error(
                id,
                ExecutionError::new("second failure")
                    .with_details(serde_json::json!({ "attempt": 2 })),
            )
            .await
            .unwrap();

        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.errors.len(), 2);
        assert_eq!(fetched.errors[0].message, "first failure");
        assert!(fetched.errors[1].details.is_some());
    }

    #[tokio::test]
    async fn test_list_by_status_newest_first() {
        let store = MemoryTaskStore::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut task = record("SortTask");
            task.created_at = Utc::now() - chrono::Duration::seconds(10 - i);
            ids.push(task.id);
            store.create(task).await.unwrap();
        }
        store
            .update_status(ids[1], TaskStatus::Running)
            .await
            .unwrap();

        let pending = store
            .list(TaskFilter {
                status: Some(TaskStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, ids[2]);
        assert_eq!(pending[1].id, ids[0]);
    }

    #[tokio::test]
    async fn test_list_by_range_enforces_limit() {
        let store = MemoryTaskStore::new();
        for i in 0..5 {
            let mut task = record("SortTask");
            task.created_at = Utc::now() - chrono::Duration::seconds(100 - i);
            store.create(task).await.unwrap();
        }

        let recent = store.most_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].created_at >= recent[1].created_at);
    }

    #[tokio::test]
    async fn test_cleanup_removes_all_indexes() {
        let store = MemoryTaskStore::new();
        let mut old = record("SortTask");
        old.created_at = Utc::now() - chrono::Duration::hours(48);
        let old_id = old.id;
        store.create(old).await.unwrap();

        let fresh = record("SortTask");
        let fresh_id = fresh.id;
        store.create(fresh).await.unwrap();

        store
            .cleanup(std::time::Duration::from_secs(24 * 3600))
            .await
            .unwrap();

        assert!(!store.exists(old_id).await.unwrap());
        assert!(store.exists(fresh_id).await.unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(store.status_count(TaskStatus::Pending), 1);
    }
}
