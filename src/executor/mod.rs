//! Bounded-concurrency task runner.
//!
//! A `tokio::sync::Semaphore` bounds how many tasks may be `Running`
//! simultaneously, a handler registry dispatches by `kind`, and results are
//! retained in a map until explicit eviction or process exit.

mod handlers;
mod task;

pub use handlers::{
    ERR_BLOCKED_COMMAND, ERR_NO_COMMAND, ERR_NOT_ALLOWLISTED, FileReadHandler, FileWriteHandler,
    Handler, HandlerContext, HandlerOutcome, PythonHandler, ScriptHandler, ServiceHandler,
    ShellHandler,
};
pub use task::{Task, TaskResult, TaskStatus};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, Semaphore};
use tracing::{info, warn};

use crate::process_host::ProcessHost;
use crate::wire::wall_clock_secs;

/// Collaborators and tunables the executor needs at construction time.
pub struct ExecutorConfig {
    pub max_concurrent_tasks: usize,
    pub task_timeout: std::time::Duration,
    /// Empty means allow all commands (subject to `blocked_commands`).
    pub allowed_commands: Vec<String>,
    pub blocked_commands: Vec<String>,
}

struct RunningTask {
    abort: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    cancel_flag: Arc<std::sync::atomic::AtomicBool>,
}

struct ExecutorState {
    results: HashMap<String, TaskResult>,
    running: HashMap<String, RunningTask>,
}

/// Bounded-concurrency task runner.
pub struct Executor {
    config: Arc<ExecutorConfig>,
    process_host: Arc<dyn ProcessHost>,
    gate: Arc<Semaphore>,
    state: Arc<Mutex<ExecutorState>>,
    handlers: Arc<Mutex<HashMap<String, Arc<dyn Handler>>>>,
}

impl Executor {
    #[must_use]
    pub fn new(config: ExecutorConfig, process_host: Arc<dyn ProcessHost>) -> Self {
        let max_concurrent = config.max_concurrent_tasks.max(1);
        let mut handlers: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        handlers.insert("shell".to_string(), Arc::new(ShellHandler));
        handlers.insert("script".to_string(), Arc::new(ScriptHandler));
        handlers.insert("python".to_string(), Arc::new(PythonHandler));
        handlers.insert("file_read".to_string(), Arc::new(FileReadHandler));
        handlers.insert("file_write".to_string(), Arc::new(FileWriteHandler));
        handlers.insert("service".to_string(), Arc::new(ServiceHandler));

        Self {
            config: Arc::new(config),
            process_host,
            gate: Arc::new(Semaphore::new(max_concurrent)),
            state: Arc::new(Mutex::new(ExecutorState {
                results: HashMap::new(),
                running: HashMap::new(),
            })),
            handlers: Arc::new(Mutex::new(handlers)),
        }
    }

    /// Register a custom handler for `kind`, overriding any built-in of the
    /// same name. Must be called before `submit` for the kinds it covers;
    /// handlers are not meant to be swapped out while tasks are in flight.
    pub async fn register_handler(&self, kind: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.lock().await.insert(kind.into(), handler);
    }

    /// Submit a task for execution; returns the task id (assigned if the
    /// task didn't carry one). The task transitions `Pending -> Running`
    /// only once the concurrency gate admits it.
    pub async fn submit(&self, task: Task) -> String {
        let task_id = task
            .task_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        {
            let mut state = self.state.lock().await;
            if state.running.contains_key(&task_id) {
                warn!(task_id = %task_id, "task already running, ignoring duplicate submission");
                return task_id;
            }
            state.results.insert(task_id.clone(), TaskResult::pending(task_id.clone()));
        }

        let (abort_tx, abort_rx) = oneshot::channel();
        let abort_tx = Arc::new(Mutex::new(Some(abort_tx)));
        let cancel_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let mut state = self.state.lock().await;
            state.running.insert(
                task_id.clone(),
                RunningTask { abort: Arc::clone(&abort_tx), cancel_flag: Arc::clone(&cancel_flag) },
            );
        }

        let config = Arc::clone(&self.config);
        let process_host = Arc::clone(&self.process_host);
        let gate = Arc::clone(&self.gate);
        let state = Arc::clone(&self.state);
        let handlers = Arc::clone(&self.handlers);
        let kind = task.kind.clone();
        let payload = task.payload.clone();
        let timeout = task.timeout.unwrap_or(config.task_timeout);
        let run_id = task_id.clone();

        tokio::spawn(async move {
            if cancel_flag.load(std::sync::atomic::Ordering::SeqCst) {
                Self::finish(&state, &run_id, Self::cancelled_result(&run_id)).await;
                return;
            }

            let Ok(_permit) = gate.acquire().await else {
                return;
            };

            if cancel_flag.load(std::sync::atomic::Ordering::SeqCst) {
                Self::finish(&state, &run_id, Self::cancelled_result(&run_id)).await;
                return;
            }

            let started_at = wall_clock_secs();
            {
                let mut guard = state.lock().await;
                if let Some(result) = guard.results.get_mut(&run_id) {
                    result.status = TaskStatus::Running;
                    result.started_at = Some(started_at);
                }
            }
            info!(task_id = %run_id, kind = %kind, "task running");

            let handler = handlers.lock().await.get(&kind).cloned();
            let Some(handler) = handler else {
                let mut result = TaskResult::pending(run_id.clone());
                result.status = TaskStatus::Failed;
                result.started_at = Some(started_at);
                result.completed_at = Some(wall_clock_secs());
                result.error = Some(format!("Unknown task kind: {kind}"));
                Self::finish(&state, &run_id, result).await;
                return;
            };

            let ctx = HandlerContext {
                process_host,
                allowed_commands: Arc::new(config.allowed_commands.clone()),
                blocked_commands: Arc::new(config.blocked_commands.clone()),
                abort: abort_rx,
            };

            let handler_fut = handler.run(payload, ctx);
            tokio::pin!(handler_fut);

            let outcome = tokio::select! {
                outcome = &mut handler_fut => Ok(outcome),
                () = tokio::time::sleep(timeout) => {
                    // Signal the handler to abort (killing any child process)
                    // and let it run to completion instead of dropping it, so
                    // a timed-out task never leaves an orphaned process.
                    if let Some(tx) = abort_tx.lock().await.take() {
                        let _ = tx.send(());
                    }
                    let _ = handler_fut.await;
                    Err(())
                }
            };

            let completed_at = wall_clock_secs();
            let mut result = TaskResult::pending(run_id.clone());
            result.started_at = Some(started_at);
            result.completed_at = Some(completed_at);

            match outcome {
                Ok(outcome) => {
                    if cancel_flag.load(std::sync::atomic::Ordering::SeqCst) {
                        result.status = TaskStatus::Cancelled;
                    } else if outcome.success {
                        result.status = TaskStatus::Completed;
                    } else {
                        result.status = TaskStatus::Failed;
                    }
                    result.exit_code = outcome.exit_code;
                    result.stdout = outcome.stdout;
                    result.stderr = outcome.stderr;
                    result.error = outcome.error;
                }
                Err(()) => {
                    result.status = TaskStatus::Timeout;
                    result.error = Some(format!("Task timed out after {}s", timeout.as_secs_f64()));
                }
            }

            Self::finish(&state, &run_id, result).await;
        });

        task_id
    }

    fn cancelled_result(task_id: &str) -> TaskResult {
        let mut result = TaskResult::pending(task_id.to_string());
        result.status = TaskStatus::Cancelled;
        result.completed_at = Some(wall_clock_secs());
        result
    }

    async fn finish(state: &Arc<Mutex<ExecutorState>>, task_id: &str, result: TaskResult) {
        let mut guard = state.lock().await;
        guard.running.remove(task_id);
        guard.results.insert(task_id.to_string(), result);
    }

    /// Cancel a task. Idempotent. A `Running` task's handler is asked to
    /// abort (propagating to any child process); a `Pending` task that
    /// hasn't acquired the gate yet is marked `Cancelled` directly.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(running) = state.running.remove(task_id) else {
            return false;
        };
        running.cancel_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(tx) = running.abort.lock().await.take() {
            let _ = tx.send(());
        }

        if let Some(result) = state.results.get_mut(task_id) {
            if !result.status.is_terminal() {
                result.status = TaskStatus::Cancelled;
                result.completed_at = Some(wall_clock_secs());
            }
        }
        true
    }

    /// Look up the current (possibly non-terminal) result for a task.
    pub async fn result(&self, task_id: &str) -> Option<TaskResult> {
        self.state.lock().await.results.get(task_id).cloned()
    }

    /// Task ids currently occupying a gate slot or awaiting one.
    pub async fn running(&self) -> Vec<String> {
        self.state.lock().await.running.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_host::TokioProcessHost;
    use serde_json::{json, Map};
    use std::time::Duration;

    fn executor(max_concurrent: usize) -> Executor {
        Executor::new(
            ExecutorConfig {
                max_concurrent_tasks: max_concurrent,
                task_timeout: Duration::from_secs(5),
                allowed_commands: vec![],
                blocked_commands: vec!["rm -rf /".to_string()],
            },
            Arc::new(TokioProcessHost),
        )
    }

    fn shell_task(command: &str) -> Task {
        let mut payload = Map::new();
        payload.insert("command".to_string(), json!(command));
        Task {
            task_id: None,
            kind: "shell".to_string(),
            payload,
            timeout: None,
        }
    }

    async fn wait_for_terminal(executor: &Executor, task_id: &str) -> TaskResult {
        for _ in 0..200 {
            if let Some(result) = executor.result(task_id).await {
                if result.status.is_terminal() {
                    return result;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn submit_assigns_task_id_when_absent() {
        let exec = executor(4);
        let id = exec.submit(shell_task("echo hi")).await;
        assert!(!id.is_empty());
        let result = wait_for_terminal(&exec, &id).await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.stdout, "hi\n");
    }

    #[tokio::test]
    async fn empty_command_fails_with_fixed_reason() {
        let exec = executor(4);
        let id = exec.submit(shell_task("")).await;
        let result = wait_for_terminal(&exec, &id).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some(ERR_NO_COMMAND));
    }

    #[tokio::test]
    async fn allowlist_rejects_commands_outside_it() {
        let exec = Executor::new(
            ExecutorConfig {
                max_concurrent_tasks: 4,
                task_timeout: Duration::from_secs(5),
                allowed_commands: vec!["echo".to_string()],
                blocked_commands: vec![],
            },
            Arc::new(TokioProcessHost),
        );
        let id = exec.submit(shell_task("cat /etc/passwd")).await;
        let result = wait_for_terminal(&exec, &id).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some(ERR_NOT_ALLOWLISTED));
    }

    #[tokio::test]
    async fn allowlist_admits_matching_commands() {
        let exec = Executor::new(
            ExecutorConfig {
                max_concurrent_tasks: 4,
                task_timeout: Duration::from_secs(5),
                allowed_commands: vec!["echo".to_string()],
                blocked_commands: vec![],
            },
            Arc::new(TokioProcessHost),
        );
        let id = exec.submit(shell_task("echo hi")).await;
        let result = wait_for_terminal(&exec, &id).await;
        assert_eq!(result.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn blocked_command_fails_with_fixed_reason() {
        let exec = executor(4);
        let id = exec.submit(shell_task("rm -rf /")).await;
        let result = wait_for_terminal(&exec, &id).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some(ERR_BLOCKED_COMMAND));
    }

    #[tokio::test]
    async fn max_concurrent_one_serializes_three_tasks() {
        let exec = executor(1);
        let ids = vec![
            exec.submit(shell_task("sleep 0.1 && echo a")).await,
            exec.submit(shell_task("sleep 0.1 && echo b")).await,
            exec.submit(shell_task("sleep 0.1 && echo c")).await,
        ];
        for id in &ids {
            let result = wait_for_terminal(&exec, id).await;
            assert_eq!(result.status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn timeout_shorter_than_command_yields_timeout_status() {
        let exec = Executor::new(
            ExecutorConfig {
                max_concurrent_tasks: 4,
                task_timeout: Duration::from_millis(50),
                allowed_commands: vec![],
                blocked_commands: vec![],
            },
            Arc::new(TokioProcessHost),
        );
        let id = exec.submit(shell_task("sleep 5")).await;
        let result = wait_for_terminal(&exec, &id).await;
        assert_eq!(result.status, TaskStatus::Timeout);
    }

    #[tokio::test]
    async fn cancel_running_task_marks_cancelled() {
        let exec = executor(4);
        let id = exec.submit(shell_task("sleep 5")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(exec.cancel(&id).await);
        let result = wait_for_terminal(&exec, &id).await;
        assert_eq!(result.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_pending_task_before_gate_acquired() {
        let exec = executor(1);
        let blocker = exec.submit(shell_task("sleep 0.3")).await;
        let pending = exec.submit(shell_task("echo unreached")).await;
        assert!(exec.cancel(&pending).await);
        let result = wait_for_terminal(&exec, &pending).await;
        assert_eq!(result.status, TaskStatus::Cancelled);
        let _ = wait_for_terminal(&exec, &blocker).await;
    }

    #[tokio::test]
    async fn cancel_unknown_task_returns_false() {
        let exec = executor(4);
        assert!(!exec.cancel("nonexistent").await);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let exec = executor(4);
        let id = exec.submit(shell_task("sleep 5")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(exec.cancel(&id).await);
        assert!(!exec.cancel(&id).await);
    }

    #[tokio::test]
    async fn running_lists_in_flight_task_ids() {
        let exec = executor(4);
        let id = exec.submit(shell_task("sleep 0.2")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(exec.running().await.contains(&id));
        let _ = wait_for_terminal(&exec, &id).await;
        assert!(!exec.running().await.contains(&id));
    }

    #[tokio::test]
    async fn result_of_unknown_task_is_none() {
        let exec = executor(4);
        assert!(exec.result("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn unknown_kind_fails() {
        let exec = executor(4);
        let task = Task { task_id: None, kind: "nonexistent".to_string(), payload: Map::new(), timeout: None };
        let id = exec.submit(task).await;
        let result = wait_for_terminal(&exec, &id).await;
        assert_eq!(result.status, TaskStatus::Failed);
    }
}
