use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{Task, TaskStore};
use tokio::sync::RwLock;

/// 进程内任务存储
///
/// 任务持有处理函数，无法跨节点共享；每个节点注册同一组任务，由协调器决定谁来派发。
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn upsert(&self, task: Task) -> ClusterResult<()> {
        self.tasks.write().await.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, id: &str) -> ClusterResult<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn remove(&self, id: &str) -> ClusterResult<Option<Task>> {
        Ok(self.tasks.write().await.remove(id))
    }

    async fn list(&self) -> ClusterResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn due(&self, now: DateTime<Utc>) -> ClusterResult<Vec<Task>> {
        let mut due: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|t| t.runtime.next_run);
        Ok(due)
    }

    async fn advance(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> ClusterResult<bool> {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(id) else {
            return Ok(false);
        };
        task.runtime.last_run = Some(last_run);
        task.runtime.next_run = next_run;
        Ok(true)
    }

    async fn record_outcome(&self, id: &str, success: bool) -> ClusterResult<()> {
        let mut tasks = self.tasks.write().await;
        // 执行期间被注销的任务不再记录
        if let Some(task) = tasks.get_mut(id) {
            task.runtime.run_count += 1;
            if !success {
                task.runtime.fail_count += 1;
            }
        }
        Ok(())
    }

    async fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> ClusterResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| ClusterError::task_not_found(id))?;
        task.enabled = enabled;
        task.runtime.next_run = next_run;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_domain::TaskContext;

    fn task(id: &str) -> Task {
        Task::new(id, "test", "* * * * * *", |_ctx: TaskContext| async { Ok(()) })
    }

    #[tokio::test]
    async fn test_due_and_advance() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();

        let mut due = task("due");
        due.runtime.next_run = Some(now - chrono::Duration::seconds(1));
        let mut later = task("later");
        later.runtime.next_run = Some(now + chrono::Duration::seconds(60));
        let mut off = task("off").disabled();
        off.runtime.next_run = Some(now - chrono::Duration::seconds(1));

        store.upsert(due).await.unwrap();
        store.upsert(later).await.unwrap();
        store.upsert(off).await.unwrap();

        let ids: Vec<String> = store.due(now).await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["due".to_string()]);

        let next = now + chrono::Duration::seconds(5);
        assert!(store.advance("due", now, Some(next)).await.unwrap());
        assert!(store.due(now).await.unwrap().is_empty());
        assert!(!store.advance("missing", now, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_outcome_and_enable() {
        let store = InMemoryTaskStore::new();
        store.upsert(task("t")).await.unwrap();

        store.record_outcome("t", true).await.unwrap();
        store.record_outcome("t", false).await.unwrap();
        let runtime = store.get("t").await.unwrap().unwrap().runtime;
        assert_eq!((runtime.run_count, runtime.fail_count), (2, 1));

        store.set_enabled("t", false, None).await.unwrap();
        assert!(!store.get("t").await.unwrap().unwrap().enabled);
        assert!(matches!(
            store.set_enabled("x", true, None).await,
            Err(ClusterError::TaskNotFound { .. })
        ));
    }
}
