// SPDX-License-Identifier: GPL-3.0-only

//! TaskManager: a small named registry of `tokio::spawn` handles, giving
//! every long-lived task a name that can be cancelled and awaited. Grounded
//! on the `tokio::spawn` + `Arc<AtomicBool>` cancellation idiom used
//! throughout the pipeline and router modules, here generalized into a
//! shared facility instead of each owner hand-rolling its own handle field.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// Registry of named background tasks. Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct TaskManager {
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task under `name`, spawning `fut`. A previous task under
    /// the same name is aborted first; tasks are expected to be cooperative,
    /// so this is a fallback rather than the normal shutdown path.
    pub async fn spawn<F>(&self, name: impl Into<String>, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(fut);
        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.insert(name.clone(), handle) {
            previous.abort();
        }
    }

    /// Aborts the named task immediately, without waiting for it to notice.
    pub async fn cancel(&self, name: &str) {
        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.remove(name) {
            handle.abort();
        }
    }

    /// Removes and awaits the named task, assuming it was signaled to stop
    /// cooperatively by the caller before this is called.
    pub async fn join(&self, name: &str) {
        let handle = self.tasks.lock().await.remove(name);
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            warn!(task = name, error = %e, "task panicked");
        }
    }

    /// Aborts and drops every registered task. Used during hard shutdown.
    pub async fn cancel_all(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    pub async fn names(&self) -> Vec<String> {
        self.tasks.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn join_waits_for_cooperative_completion() {
        let manager = TaskManager::new();
        let done = Arc::new(AtomicBool::new(false));
        let task_done = done.clone();
        manager
            .spawn("worker", async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                task_done.store(true, Ordering::SeqCst);
            })
            .await;
        manager.join("worker").await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_all_removes_every_task() {
        let manager = TaskManager::new();
        manager.spawn("a", async { std::future::pending::<()>().await }).await;
        manager.spawn("b", async { std::future::pending::<()>().await }).await;
        manager.cancel_all().await;
        assert!(manager.names().await.is_empty());
    }
}
