//! SQLite implementation of [`TaskStore`].
//!
//! Migrations under `migrations/` are embedded at compile time with
//! `sqlx::migrate!` and applied by [`SqliteTaskStore::connect`]. Queries use
//! the runtime-checked `sqlx::query` form, so building needs no
//! `DATABASE_URL`.
//!
//! The pool holds a single connection that is never recycled: SQLite
//! serializes writers anyway, every `update` transaction then runs without
//! contention, and a `sqlite::memory:` database lives as long as the store.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::warn;

use super::{StoreError, TaskStore, check_identity, page_bounds};
use crate::task::{Task, TaskStatus};

const SELECT_BY_ID: &str = "SELECT id, filename, original_path, segmentation_path, status, progress, message, \
     kidney_volume, tumor_volume, processing_time, created_at, updated_at, completed_at \
     FROM tasks WHERE id = ?1";

const SELECT_PAGE: &str = "SELECT id, filename, original_path, segmentation_path, status, progress, message, \
     kidney_volume, tumor_volume, processing_time, created_at, updated_at, completed_at \
     FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2";

#[derive(Clone, Debug)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `"sqlite://data/segflow.db"`, or
    /// `"sqlite::memory:"` for tests.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    filename: String,
    original_path: String,
    segmentation_path: Option<String>,
    status: String,
    progress: i64,
    message: Option<String>,
    kidney_volume: Option<f64>,
    tumor_volume: Option<f64>,
    processing_time: Option<f64>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status)
            .map_err(|_| StoreError::Invalid(format!("task {} has unknown status '{}'", row.id, row.status)))?;
        Ok(Task {
            created_at: parse_ts(&row.created_at, "created_at"),
            updated_at: parse_ts(&row.updated_at, "updated_at"),
            completed_at: row.completed_at.as_deref().map(|raw| parse_ts(raw, "completed_at")),
            id: row.id,
            filename: row.filename,
            original_path: PathBuf::from(row.original_path),
            segmentation_path: row.segmentation_path.map(PathBuf::from),
            status,
            progress: row.progress.clamp(0, 100) as u8,
            message: row.message,
            kidney_volume: row.kidney_volume,
            tumor_volume: row.tumor_volume,
            processing_time: row.processing_time,
        })
    }
}

fn to_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str, field: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|e: chrono::ParseError| {
        warn!(raw = %raw, field, error = %e, "failed to parse task timestamp; using now");
        Utc::now()
    })
}

fn path_text(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: Task) -> Result<String, StoreError> {
        let result = sqlx::query(
            "INSERT INTO tasks (id, filename, original_path, segmentation_path, status, progress, message, \
             kidney_volume, tumor_volume, processing_time, created_at, updated_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&task.id)
        .bind(&task.filename)
        .bind(path_text(&task.original_path))
        .bind(task.segmentation_path.as_deref().map(path_text))
        .bind(task.status.as_ref())
        .bind(i64::from(task.progress))
        .bind(&task.message)
        .bind(task.kidney_volume)
        .bind(task.tumor_volume)
        .bind(task.processing_time)
        .bind(to_ts(task.created_at))
        .bind(to_ts(task.updated_at))
        .bind(task.completed_at.map(to_ts))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(task.id),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::AlreadyExists { id: task.id })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let row: Option<TaskRow> = sqlx::query_as(SELECT_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn update<T, F>(&self, id: &str, mutate: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Task) -> Result<T, StoreError> + Send,
        T: Send,
    {
        // Dropping `tx` on any early return rolls the transaction back.
        let mut tx = self.pool.begin().await?;
        let row: Option<TaskRow> = sqlx::query_as(SELECT_BY_ID)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut task = match row {
            Some(row) => Task::try_from(row)?,
            None => return Err(StoreError::NotFound { id: id.to_owned() }),
        };

        let out = mutate(&mut task)?;
        check_identity(id, &task)?;
        task.updated_at = Utc::now();

        sqlx::query(
            "UPDATE tasks SET segmentation_path = ?1, status = ?2, progress = ?3, message = ?4, \
             kidney_volume = ?5, tumor_volume = ?6, processing_time = ?7, updated_at = ?8, completed_at = ?9 \
             WHERE id = ?10",
        )
        .bind(task.segmentation_path.as_deref().map(path_text))
        .bind(task.status.as_ref())
        .bind(i64::from(task.progress))
        .bind(&task.message)
        .bind(task.kidney_volume)
        .bind(task.tumor_volume)
        .bind(task.processing_time)
        .bind(to_ts(task.updated_at))
        .bind(task.completed_at.map(to_ts))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(out)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, page: u32, page_size: u32) -> Result<(Vec<Task>, u64), StoreError> {
        let (offset, limit) = page_bounds(page, page_size);
        let rows: Vec<TaskRow> = sqlx::query_as(SELECT_PAGE)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        let tasks = rows.into_iter().map(Task::try_from).collect::<Result<Vec<_>, _>>()?;
        Ok((tasks, total.max(0) as u64))
    }

    async fn fail_interrupted(&self, message: &str) -> Result<u64, StoreError> {
        let now = to_ts(Utc::now());
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, progress = 0, message = ?2, segmentation_path = NULL, \
             kidney_volume = NULL, tumor_volume = NULL, processing_time = NULL, \
             completed_at = ?3, updated_at = ?3 \
             WHERE status = ?4",
        )
        .bind(TaskStatus::Failed.as_ref())
        .bind(message)
        .bind(&now)
        .bind(TaskStatus::Processing.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::contract;
    use super::*;

    async fn store() -> SqliteTaskStore {
        SqliteTaskStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_get_delete() {
        contract::create_get_delete(&store().await).await;
    }

    #[tokio::test]
    async fn update_commits_or_rolls_back() {
        contract::update_commits_or_rolls_back(&store().await).await;
    }

    #[tokio::test]
    async fn update_of_missing_id_does_not_resurrect() {
        contract::update_of_missing_id_does_not_resurrect(&store().await).await;
    }

    #[tokio::test]
    async fn id_changes_are_rejected() {
        contract::id_changes_are_rejected(&store().await).await;
    }

    #[tokio::test]
    async fn list_is_newest_first_and_paged() {
        contract::list_is_newest_first_and_paged(&store().await).await;
    }

    #[tokio::test]
    async fn interrupted_tasks_fail() {
        contract::interrupted_tasks_fail(&store().await).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_serialized() {
        contract::concurrent_updates_are_serialized(Arc::new(store().await)).await;
    }

    #[tokio::test]
    async fn records_survive_reconnect() {
        let dir = crate::test_support::TempDir::new("sqlite");
        let url = format!("sqlite://{}", dir.path().join("tasks.db").display());

        let store = SqliteTaskStore::connect(&url).await.unwrap();
        let task = Task::new("persisted", "scan.nii", PathBuf::from("/data/persisted/original.nii"));
        store.create(task).await.unwrap();
        drop(store);

        let reopened = SqliteTaskStore::connect(&url).await.unwrap();
        let fetched = reopened.get("persisted").await.unwrap().unwrap();
        assert_eq!(fetched.original_path, PathBuf::from("/data/persisted/original.nii"));
        assert_eq!(fetched.message.as_deref(), Some("queued"));
    }

    #[tokio::test]
    async fn unknown_status_is_reported_not_panicked() {
        let store = store().await;
        store
            .create(Task::new("odd", "x.nii", PathBuf::from("/x.nii")))
            .await
            .unwrap();
        sqlx::query("UPDATE tasks SET status = 'paused' WHERE id = 'odd'")
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(matches!(store.get("odd").await, Err(StoreError::Invalid(_))));
    }
}
