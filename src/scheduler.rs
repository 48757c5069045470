//! Min-heap driver for delayed and recurring internal tasks.
//!
//! A `BinaryHeap` (reversed, so it behaves as a min-heap) plus an
//! authoritative `task_id → entry` map. Cancellation and reschedule leave
//! stale heap entries in place; they're filtered on pop by comparing
//! against the authoritative map before any callback runs.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;

/// One entry in the schedule, ordered by `run_at`.
#[derive(Debug, Clone)]
pub struct ScheduledEntry {
    pub run_at: Instant,
    pub task_id: String,
    pub kind: String,
    pub payload: Map<String, Value>,
    pub repeat_interval: Option<Duration>,
    pub created_at: Instant,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at
    }
}
impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reversed so `BinaryHeap` (a max-heap) pops the earliest `run_at` first.
impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.run_at.cmp(&self.run_at)
    }
}

/// Driver wakeup ceiling when no entry is due sooner.
const TICK_RESOLUTION: Duration = Duration::from_millis(100);

type Callback = Arc<dyn Fn(ScheduledEntry) + Send + Sync>;

struct SchedulerState {
    heap: BinaryHeap<ScheduledEntry>,
    authoritative: HashMap<String, ScheduledEntry>,
}

/// Priority-queue driver for delayed and recurring internal tasks.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    callbacks: Mutex<Vec<Callback>>,
    clock: Arc<dyn Clock>,
    shutdown_tx: tokio::sync::mpsc::Sender<()>,
    shutdown_rx: Mutex<Option<tokio::sync::mpsc::Receiver<()>>>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
        Arc::new(Self {
            state: Mutex::new(SchedulerState {
                heap: BinaryHeap::new(),
                authoritative: HashMap::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
            clock,
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
            driver: Mutex::new(None),
        })
    }

    /// Register a callback invoked (synchronously, from the driver task)
    /// whenever an entry fires. Exceptions inside the closure are not
    /// catchable in Rust; callers that need isolation should make their
    /// closure itself never panic (e.g. log-and-return).
    pub async fn add_callback<F>(&self, callback: F)
    where
        F: Fn(ScheduledEntry) + Send + Sync + 'static,
    {
        self.callbacks.lock().await.push(Arc::new(callback));
    }

    /// Schedule a task for (optionally repeating) future execution.
    pub async fn schedule(
        &self,
        kind: impl Into<String>,
        payload: Map<String, Value>,
        delay: Duration,
        repeat_interval: Option<Duration>,
        task_id: Option<String>,
    ) -> String {
        let task_id = task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let run_at = self.clock.now() + delay;
        let entry = ScheduledEntry {
            run_at,
            task_id: task_id.clone(),
            kind: kind.into(),
            payload,
            repeat_interval,
            created_at: self.clock.now(),
        };

        let mut state = self.state.lock().await;
        state.authoritative.insert(task_id.clone(), entry.clone());
        state.heap.push(entry);
        debug!(task_id = %task_id, delay_ms = delay.as_millis(), "scheduled task");
        task_id
    }

    /// Cancel a scheduled entry. Idempotent; the heap entry (if any) is
    /// filtered out on pop rather than removed eagerly.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().await;
        state.authoritative.remove(task_id).is_some()
    }

    /// Reschedule an existing entry to run after `delay` from now, keeping
    /// its kind/payload/repeat settings. Returns `false` if unknown.
    pub async fn reschedule(&self, task_id: &str, delay: Duration) -> bool {
        let mut state = self.state.lock().await;
        let Some(old) = state.authoritative.get(task_id).cloned() else {
            return false;
        };
        let entry = ScheduledEntry {
            run_at: self.clock.now() + delay,
            task_id: task_id.to_string(),
            kind: old.kind,
            payload: old.payload,
            repeat_interval: old.repeat_interval,
            created_at: old.created_at,
        };
        state.authoritative.insert(task_id.to_string(), entry.clone());
        state.heap.push(entry);
        true
    }

    /// Snapshot of all currently-scheduled entries.
    pub async fn list(&self) -> Vec<ScheduledEntry> {
        self.state.lock().await.authoritative.values().cloned().collect()
    }

    /// Start the driver loop. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut driver = self.driver.lock().await;
        if driver.is_some() {
            return;
        }
        let Some(shutdown_rx) = self.shutdown_rx.lock().await.take() else {
            return;
        };
        let this = Arc::clone(self);
        *driver = Some(tokio::spawn(this.run(shutdown_rx)));
    }

    /// Stop the driver loop and await it. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Some(handle) = self.driver.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: tokio::sync::mpsc::Receiver<()>) {
        loop {
            let deadline = {
                let state = self.state.lock().await;
                state.heap.peek().map_or_else(
                    || self.clock.now() + TICK_RESOLUTION,
                    |entry| entry.run_at.min(self.clock.now() + TICK_RESOLUTION),
                )
            };

            tokio::select! {
                () = self.clock.sleep_until(deadline) => {
                    self.process_due().await;
                }
                Some(()) = shutdown_rx.recv() => {
                    return;
                }
            }
        }
    }

    /// Pop and fire every entry whose `run_at` has elapsed, filtering stale
    /// heap entries (cancelled or superseded by a reschedule) before
    /// invoking any callback.
    async fn process_due(&self) {
        let now = self.clock.now();
        loop {
            let due = {
                let mut state = self.state.lock().await;
                match state.heap.peek() {
                    Some(top) if top.run_at <= now => {}
                    _ => break,
                }
                let popped = state.heap.pop().expect("peeked Some above");

                let Some(current) = state.authoritative.get(&popped.task_id) else {
                    continue;
                };
                if current.run_at != popped.run_at {
                    continue;
                }
                popped
            };

            let callbacks = self.callbacks.lock().await.clone();
            for cb in &callbacks {
                cb(due.clone());
            }

            let mut state = self.state.lock().await;
            if let Some(interval) = due.repeat_interval {
                if let Some(current) = state.authoritative.get(&due.task_id) {
                    if current.run_at == due.run_at {
                        let next = ScheduledEntry {
                            run_at: self.clock.now() + interval,
                            task_id: due.task_id.clone(),
                            kind: due.kind.clone(),
                            payload: due.payload.clone(),
                            repeat_interval: Some(interval),
                            created_at: due.created_at,
                        };
                        state.authoritative.insert(due.task_id.clone(), next.clone());
                        state.heap.push(next);
                    }
                }
            } else {
                state.authoritative.remove(&due.task_id);
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}
