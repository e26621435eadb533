use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct RunningTask {
    id: Uuid,
    cancel: CancellationToken,
    started_at: Instant,
}

/// Handle returned on admission. Identifies this particular run so cleanup
/// never removes a newer task registered under the same key.
#[derive(Debug, Clone)]
pub struct TaskTicket {
    pub id: Uuid,
    pub cancel: CancellationToken,
}

/// At most one running task per conversation key.
///
/// Presence of an entry is what makes a key busy.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, RunningTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task for `key` unless one is already running.
    pub fn try_register(&self, key: &str) -> Option<TaskTicket> {
        let mut tasks = self.tasks.write().ok()?;
        if tasks.contains_key(key) {
            return None;
        }
        let ticket = TaskTicket {
            id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        };
        tasks.insert(
            key.to_string(),
            RunningTask {
                id: ticket.id,
                cancel: ticket.cancel.clone(),
                started_at: Instant::now(),
            },
        );
        Some(ticket)
    }

    /// Cancel and remove the task for `key`. Returns whether one was running.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = match self.tasks.write() {
            Ok(mut tasks) => tasks.remove(key),
            Err(_) => None,
        };
        match removed {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `key` if it still belongs to task `id`.
    pub fn remove(&self, key: &str, id: Uuid) -> bool {
        let Ok(mut tasks) = self.tasks.write() else {
            return false;
        };
        if tasks.get(key).is_some_and(|task| task.id == id) {
            tasks.remove(key);
            true
        } else {
            false
        }
    }

    /// Signal cancellation to every registered task.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<RunningTask> = match self.tasks.write() {
            Ok(mut tasks) => tasks.drain().map(|(_, task)| task).collect(),
            Err(_) => return 0,
        };
        for task in &drained {
            task.cancel.cancel();
        }
        drained.len()
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.tasks
            .read()
            .map(|tasks| tasks.contains_key(key))
            .unwrap_or(false)
    }

    /// How long the task for `key` has been running.
    pub fn elapsed(&self, key: &str) -> Option<Duration> {
        let tasks = self.tasks.read().ok()?;
        tasks.get(key).map(|task| task.started_at.elapsed())
    }

    pub fn len(&self) -> usize {
        self.tasks.read().map(|tasks| tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
