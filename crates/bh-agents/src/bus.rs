use std::sync::{Arc, Mutex};

use bh_core::types::{StageName, TaskUpdate, WorkflowStatus};
use serde::{Deserialize, Serialize};

/// One merged partial update, as broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageUpdate {
    pub task_id: String,
    pub stage: StageName,
    /// Task status right after the update was merged.
    pub status: WorkflowStatus,
    pub update: TaskUpdate,
}

struct Subscriber {
    /// `None` receives every task's updates.
    task_id: Option<String>,
    tx: flume::Sender<StageUpdate>,
}

impl Subscriber {
    fn wants(&self, update: &StageUpdate) -> bool {
        self.task_id
            .as_deref()
            .is_none_or(|id| id == update.task_id)
    }
}

/// Fan-out of stage updates over unbounded flume channels.
///
/// A subscription only sees updates published after it was made. Clones
/// share subscribers; once every bus handle is dropped, receivers drain and
/// then disconnect.
#[derive(Clone, Default)]
pub struct UpdateBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl UpdateBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> flume::Receiver<StageUpdate> {
        self.add(None)
    }

    /// Updates for `task_id` only.
    pub fn subscribe_task(&self, task_id: &str) -> flume::Receiver<StageUpdate> {
        self.add(Some(task_id.to_string()))
    }

    fn add(&self, task_id: Option<String>) -> flume::Receiver<StageUpdate> {
        let (tx, rx) = flume::unbounded();
        self.subscribers
            .lock()
            .expect("UpdateBus lock poisoned")
            .push(Subscriber { task_id, tx });
        rx
    }

    /// Deliver to every interested subscriber. Subscribers whose receiver is
    /// gone are dropped on the next update they would have received.
    pub fn publish(&self, update: StageUpdate) {
        let mut subscribers = self.subscribers.lock().expect("UpdateBus lock poisoned");
        subscribers.retain(|s| !s.wants(&update) || s.tx.send(update.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("UpdateBus lock poisoned").len()
    }
}
