//! Task record persistence.
//!
//! [`TaskStore`] is the single source of truth for task status. Every
//! mutation goes through [`TaskStore::update`], which runs a closure against
//! the current record inside one atomic scope: the closure's changes are
//! committed when it returns `Ok` and discarded when it returns `Err`. An
//! update against a deleted id fails with [`StoreError::NotFound`] and never
//! recreates the record.

mod memory;
mod sqlite;

use std::future::Future;

use thiserror::Error;

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use crate::task::{Task, TransitionError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {id} not found")]
    NotFound { id: String },

    #[error("task {id} already exists")]
    AlreadyExists { id: String },

    /// The mutation closure rejected a lifecycle transition.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A stored row could not be decoded, or a mutation broke record identity.
    #[error("invalid task record: {0}")]
    Invalid(String),
}

pub trait TaskStore: Send + Sync + 'static {
    /// Insert a new record and return its id.
    fn create(&self, task: Task) -> impl Future<Output = Result<String, StoreError>> + Send;

    fn get(&self, id: &str) -> impl Future<Output = Result<Option<Task>, StoreError>> + Send;

    /// Apply `mutate` to the record atomically.
    ///
    /// `updated_at` is refreshed on commit. The closure must not change the
    /// record's id.
    fn update<T, F>(&self, id: &str, mutate: F) -> impl Future<Output = Result<T, StoreError>> + Send
    where
        F: FnOnce(&mut Task) -> Result<T, StoreError> + Send,
        T: Send;

    /// Remove the record; `false` when it did not exist.
    fn delete(&self, id: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// One page of records, newest first, plus the total record count.
    /// Pages are 1-based.
    fn list(
        &self,
        page: u32,
        page_size: u32,
    ) -> impl Future<Output = Result<(Vec<Task>, u64), StoreError>> + Send;

    /// Move every `PROCESSING` record to `FAILED` with `message`. Used at
    /// start-up, when no worker of a previous process can still own them.
    fn fail_interrupted(&self, message: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

fn check_identity(id: &str, task: &Task) -> Result<(), StoreError> {
    if task.id != id {
        return Err(StoreError::Invalid(format!(
            "update of task {id} attempted to change its id to {}",
            task.id
        )));
    }
    Ok(())
}

fn page_bounds(page: u32, page_size: u32) -> (usize, usize) {
    let offset = (page.max(1) as usize - 1) * page_size as usize;
    (offset, page_size as usize)
}

/// Contract tests run against every implementation.
#[cfg(test)]
pub(crate) mod contract {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::analyzer::VolumeStats;
    use crate::task::TaskStatus;

    fn task(id: &str) -> Task {
        Task::new(id, format!("{id}.nii.gz"), PathBuf::from(format!("/data/{id}/original.nii.gz")))
    }

    pub async fn create_get_delete<S: TaskStore>(store: &S) {
        let id = store.create(task("a")).await.unwrap();
        assert_eq!(id, "a");
        let fetched = store.get("a").await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Queued);
        assert_eq!(fetched.filename, "a.nii.gz");

        assert!(matches!(
            store.create(task("a")).await,
            Err(StoreError::AlreadyExists { .. })
        ));

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
    }

    pub async fn update_commits_or_rolls_back<S: TaskStore>(store: &S) {
        store.create(task("u")).await.unwrap();

        store
            .update("u", |t| Ok(t.claim("preparing")?))
            .await
            .unwrap();
        let err = store
            .update("u", |t| {
                t.advance(50, "half")?;
                Err::<(), _>(StoreError::Invalid("abort".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));

        let current = store.get("u").await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Processing);
        assert_eq!(current.progress, 10);

        store
            .update("u", |t| {
                Ok(t.complete(
                    PathBuf::from("/data/u/segmentation.nii.gz"),
                    VolumeStats {
                        kidney_volume: 12.5,
                        tumor_volume: 3.0,
                    },
                    4.25,
                )?)
            })
            .await
            .unwrap();
        let done = store.get("u").await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.kidney_volume, Some(12.5));
        assert_eq!(done.processing_time, Some(4.25));
        assert_eq!(
            done.segmentation_path,
            Some(PathBuf::from("/data/u/segmentation.nii.gz"))
        );
        assert!(done.completed_at.is_some());
        assert!(done.updated_at >= done.created_at);
    }

    pub async fn update_of_missing_id_does_not_resurrect<S: TaskStore>(store: &S) {
        store.create(task("gone")).await.unwrap();
        store.delete("gone").await.unwrap();

        let err = store
            .update("gone", |t| Ok(t.fail("late")?))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store.get("gone").await.unwrap().is_none());
    }

    pub async fn id_changes_are_rejected<S: TaskStore>(store: &S) {
        store.create(task("fixed")).await.unwrap();
        let err = store
            .update("fixed", |t| {
                t.id = "other".into();
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert!(store.get("fixed").await.unwrap().is_some());
        assert!(store.get("other").await.unwrap().is_none());
    }

    pub async fn list_is_newest_first_and_paged<S: TaskStore>(store: &S) {
        for i in 0..5 {
            store.create(task(&format!("t{i}"))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let (first, total) = store.list(1, 2).await.unwrap();
        assert_eq!(total, 5);
        let ids: Vec<_> = first.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["t4", "t3"]);

        let (last, _) = store.list(3, 2).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].id, "t0");

        let (beyond, total) = store.list(9, 2).await.unwrap();
        assert!(beyond.is_empty());
        assert_eq!(total, 5);
    }

    pub async fn interrupted_tasks_fail<S: TaskStore>(store: &S) {
        store.create(task("running")).await.unwrap();
        store.create(task("waiting")).await.unwrap();
        store
            .update("running", |t| Ok(t.claim("preparing")?))
            .await
            .unwrap();

        let n = store.fail_interrupted("interrupted by restart").await.unwrap();
        assert_eq!(n, 1);
        let running = store.get("running").await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Failed);
        assert_eq!(running.message.as_deref(), Some("interrupted by restart"));
        assert_eq!(
            store.get("waiting").await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    /// Concurrent read-modify-write cycles must not lose updates.
    pub async fn concurrent_updates_are_serialized<S: TaskStore>(store: Arc<S>) {
        store.create(task("c")).await.unwrap();
        store
            .update("c", |t| Ok(t.claim("preparing")?))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update("c", |t| {
                        let next = t.progress + 1;
                        Ok(t.advance(next, "step")?)
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get("c").await.unwrap().unwrap().progress, 30);
    }
}
