//! Concurrency-limited priority scheduler for agent dispatches.
//!
//! Tasks either execute immediately (while `running < max_concurrent`) or
//! queue at the first index whose task has a strictly greater priority
//! number, preserving FIFO within a priority class. Each execution drives
//! the dispatch stream, forwards events, and drains the queue when capacity
//! frees up.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::AgentEvent;

use super::registry::AgentEntry;

// ─── TaskPriority ────────────────────────────────────────────────────────────

/// Lower number = higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    User,
    Delegation,
    Background,
}

impl TaskPriority {
    pub fn rank(self) -> u8 {
        match self {
            TaskPriority::User => 1,
            TaskPriority::Delegation => 2,
            TaskPriority::Background => 3,
        }
    }
}

// ─── ScheduledTask ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub agent_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub priority: TaskPriority,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_overrides: Option<Value>,
}

impl ScheduledTask {
    pub fn new(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            message: message.into(),
            session_id: None,
            priority: TaskPriority::User,
            enqueued_at: Utc::now(),
            correlation_id: None,
            binding_overrides: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

// ─── AgentScheduler ──────────────────────────────────────────────────────────

pub type EventCallback = Arc<dyn Fn(AgentEvent) + Send + Sync>;
pub type DoneCallback = Arc<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

struct QueuedItem {
    task: ScheduledTask,
    entry: Arc<dyn AgentEntry>,
    on_event: EventCallback,
    on_done: DoneCallback,
    on_error: ErrorCallback,
}

struct SchedulerState {
    queue: VecDeque<QueuedItem>,
    running: usize,
}

pub struct AgentScheduler {
    max_concurrent: usize,
    state: Arc<Mutex<SchedulerState>>,
}

impl AgentScheduler {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            max_concurrent: max_concurrent.max(1),
            state: Arc::new(Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                running: 0,
            })),
        })
    }

    pub fn running(&self) -> usize {
        lock(&self.state).running
    }

    pub fn queued(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Schedule a dispatch; returns the task id.
    pub fn enqueue(
        &self,
        task: ScheduledTask,
        entry: Arc<dyn AgentEntry>,
        on_event: EventCallback,
        on_done: DoneCallback,
        on_error: ErrorCallback,
    ) -> String {
        let id = task.id.clone();
        let item = QueuedItem {
            task,
            entry,
            on_event,
            on_done,
            on_error,
        };

        let run_now = {
            let mut state = lock(&self.state);
            if state.running < self.max_concurrent {
                state.running += 1;
                true
            } else {
                let rank = item.task.priority.rank();
                let position = state
                    .queue
                    .iter()
                    .position(|queued| queued.task.priority.rank() > rank)
                    .unwrap_or(state.queue.len());
                state.queue.insert(position, item);
                return id;
            }
        };

        if run_now {
            self.spawn_worker(item);
        }
        id
    }

    /// Run `item`, then keep pulling queued work while capacity allows.
    fn spawn_worker(&self, item: QueuedItem) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut current = Some(item);
            while let Some(item) = current.take() {
                run_item(item).await;
                current = {
                    let mut guard = lock(&state);
                    guard.running -= 1;
                    match guard.queue.pop_front() {
                        Some(next) => {
                            guard.running += 1;
                            Some(next)
                        }
                        None => None,
                    }
                };
            }
        });
    }
}

async fn run_item(item: QueuedItem) {
    let QueuedItem {
        task,
        entry,
        on_event,
        on_done,
        on_error,
    } = item;

    match entry.dispatch(&task.message, task.session_id.clone()).await {
        Ok(mut stream) => {
            let mut failure: Option<String> = None;
            while let Some(event) = stream.next().await {
                if let AgentEvent::Error { error } = &event {
                    failure = Some(error.clone());
                }
                on_event(event);
            }
            match failure {
                Some(error) => on_error(error),
                None => on_done(),
            }
        }
        Err(e) => on_error(e.to_string()),
    }
}

fn lock(state: &Mutex<SchedulerState>) -> std::sync::MutexGuard<'_, SchedulerState> {
    match state.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
