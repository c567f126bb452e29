//! Per-lane FIFO queues with independent concurrent drains.
//!
//! Each lane key maps to a FIFO of pending jobs and an "active" flag. The
//! first enqueue on an idle lane starts a drain task that processes jobs
//! sequentially; a failing job never aborts its lane. When a lane empties,
//! its state is erased.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use futures::future::BoxFuture;

use crate::error::Result;

type Job = BoxFuture<'static, Result<()>>;

struct LaneState {
    queue: VecDeque<Job>,
    active: bool,
}

/// The gateway's ordering bucket map.
#[derive(Clone)]
pub struct LaneQueue {
    lanes: Arc<Mutex<HashMap<String, LaneState>>>,
}

impl LaneQueue {
    pub fn new() -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of lanes currently tracked (draining or queued).
    pub fn active_lanes(&self) -> usize {
        self.lock().len()
    }

    /// Enqueue `job` on `lane_key`, starting a drain if the lane is idle.
    pub fn enqueue(&self, lane_key: &str, job: Job) {
        let start_drain = {
            let mut lanes = self.lock();
            let state = lanes.entry(lane_key.to_string()).or_insert_with(|| LaneState {
                queue: VecDeque::new(),
                active: false,
            });
            state.queue.push_back(job);
            if state.active {
                false
            } else {
                state.active = true;
                true
            }
        };

        if start_drain {
            let lanes = self.lanes.clone();
            let key = lane_key.to_string();
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut guard = match lanes.lock() {
                            Ok(g) => g,
                            Err(p) => p.into_inner(),
                        };
                        match guard.get_mut(&key) {
                            Some(state) => match state.queue.pop_front() {
                                Some(job) => Some(job),
                                None => {
                                    guard.remove(&key);
                                    None
                                }
                            },
                            None => None,
                        }
                    };
                    let Some(job) = next else { break };
                    if let Err(e) = job.await {
                        log::warn!("lane '{key}': handler failed: {e}");
                    }
                }
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LaneState>> {
        match self.lanes.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

impl Default for LaneQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{Mutex as AsyncMutex, oneshot};

    fn recorder() -> (Arc<AsyncMutex<Vec<&'static str>>>,) {
        (Arc::new(AsyncMutex::new(Vec::new())),)
    }

    #[tokio::test]
    async fn same_lane_preserves_fifo_order() {
        let lanes = LaneQueue::new();
        let (order,) = recorder();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let log = order.clone();
        lanes.enqueue(
            "L",
            Box::pin(async move {
                // First job parks until released; the second must still wait.
                let _ = release_rx.await;
                log.lock().await.push("first");
                Ok(())
            }),
        );
        let log = order.clone();
        lanes.enqueue(
            "L",
            Box::pin(async move {
                log.lock().await.push("second");
                Ok(())
            }),
        );

        // Independent lane may complete in between at any time.
        let log = order.clone();
        lanes.enqueue(
            "M",
            Box::pin(async move {
                log.lock().await.push("other-lane");
                Ok(())
            }),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        release_tx.send(()).ok();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = order.lock().await.clone();
        let lane_l: Vec<&str> = seen
            .iter()
            .copied()
            .filter(|s| *s == "first" || *s == "second")
            .collect();
        assert_eq!(lane_l, vec!["first", "second"]);
        assert!(seen.contains(&"other-lane"));
    }

    #[tokio::test]
    async fn failing_job_does_not_abort_lane() {
        let lanes = LaneQueue::new();
        let (order,) = recorder();

        lanes.enqueue(
            "L",
            Box::pin(async move { Err(crate::error::RuntimeError::Internal("boom".into())) }),
        );
        let log = order.clone();
        lanes.enqueue(
            "L",
            Box::pin(async move {
                log.lock().await.push("survivor");
                Ok(())
            }),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(order.lock().await.as_slice(), &["survivor"]);
    }

    #[tokio::test]
    async fn lane_state_erased_when_empty() {
        let lanes = LaneQueue::new();
        lanes.enqueue("L", Box::pin(async { Ok(()) }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lanes.active_lanes(), 0);
    }
}
