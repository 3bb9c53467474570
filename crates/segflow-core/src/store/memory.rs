use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use super::{StoreError, TaskStore, check_identity, page_bounds};
use crate::task::{Task, TaskStatus};

/// In-process [`TaskStore`] for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    /// Insertion sequence breaks ties between equal `created_at` values.
    tasks: HashMap<String, (u64, Task)>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: Task) -> Result<String, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists { id: task.id });
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let id = task.id.clone();
        inner.tasks.insert(id.clone(), (seq, task));
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.read().await.tasks.get(id).map(|(_, t)| t.clone()))
    }

    async fn update<T, F>(&self, id: &str, mutate: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Task) -> Result<T, StoreError> + Send,
        T: Send,
    {
        let mut inner = self.inner.write().await;
        let (_, slot) = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_owned() })?;

        let mut draft = slot.clone();
        let out = mutate(&mut draft)?;
        check_identity(id, &draft)?;
        draft.updated_at = Utc::now();
        *slot = draft;
        Ok(out)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.tasks.remove(id).is_some())
    }

    async fn list(&self, page: u32, page_size: u32) -> Result<(Vec<Task>, u64), StoreError> {
        let inner = self.inner.read().await;
        let mut all: Vec<&(u64, Task)> = inner.tasks.values().collect();
        all.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| seq_b.cmp(seq_a))
        });

        let (offset, limit) = page_bounds(page, page_size);
        let page = all
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, t)| t.clone())
            .collect();
        Ok((page, inner.tasks.len() as u64))
    }

    async fn fail_interrupted(&self, message: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut count = 0;
        for (_, task) in inner.tasks.values_mut() {
            if task.status == TaskStatus::Processing && task.fail(message).is_ok() {
                task.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::contract;
    use super::*;

    #[tokio::test]
    async fn create_get_delete() {
        contract::create_get_delete(&MemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn update_commits_or_rolls_back() {
        contract::update_commits_or_rolls_back(&MemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn update_of_missing_id_does_not_resurrect() {
        contract::update_of_missing_id_does_not_resurrect(&MemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn id_changes_are_rejected() {
        contract::id_changes_are_rejected(&MemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn list_is_newest_first_and_paged() {
        contract::list_is_newest_first_and_paged(&MemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn interrupted_tasks_fail() {
        contract::interrupted_tasks_fail(&MemoryTaskStore::new()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_serialized() {
        contract::concurrent_updates_are_serialized(Arc::new(MemoryTaskStore::new())).await;
    }
}
