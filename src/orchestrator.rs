//! Routes inbound envelope kinds to the executor/scheduler and streams
//! results back out; drives the heartbeat loop.
//!
//! Holds handles to the connection, executor, and scheduler; those
//! subsystems never reference the orchestrator back, avoiding cyclic
//! ownership — they receive callbacks by value/closure instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ResolvedConfig;
use crate::connection::{spawn_connection, ConnectionConfig, ConnectionHandle, Subscription};
use crate::executor::{Executor, ExecutorConfig, Task, TaskStatus};
use crate::metrics::{MetricsProbe, SystemMetrics};
use crate::process_host::ProcessHost;
use crate::scheduler::Scheduler;
use crate::wire::Envelope;

/// How often the orchestrator polls a submitted task's result while
/// waiting for a terminal state.
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Inbound envelope kinds the orchestrator subscribes to. `ping` is
/// included only so activity is observable/logged; the connection
/// transport already answers every inbound `ping` with a `pong` at the
/// wire level before this subscription ever sees it, so the handler
/// below must not send a second `pong`.
const INBOUND_KINDS: [&str; 6] = ["task", "execute_task", "cancel", "ping", "config", "registered"];

/// Wires a connection, executor, and scheduler together and runs the
/// agent's message-routing and heartbeat loops until `stop` is called.
pub struct Orchestrator {
    agent_id: String,
    heartbeat_interval: Duration,
    metrics_interval: Duration,
    report_system_metrics: bool,
    connection: ConnectionHandle,
    executor: Arc<Executor>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<dyn MetricsProbe>,
    metrics_cache: tokio::sync::Mutex<Option<SystemMetrics>>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build and start every subsystem: spawns the connection supervisor,
    /// starts the scheduler driver, wires the scheduled-task hook, and
    /// spawns one receive loop per inbound envelope kind plus the
    /// heartbeat loop. Returns once everything is running in the
    /// background; it never blocks the caller on the network.
    #[must_use]
    pub fn start(
        config: &ResolvedConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsProbe>,
        process_host: Arc<dyn ProcessHost>,
    ) -> Arc<Self> {
        let executor = Arc::new(Executor::new(
            ExecutorConfig {
                max_concurrent_tasks: config.executor.max_concurrent_tasks,
                task_timeout: Duration::from_secs(config.executor.task_timeout_secs),
                allowed_commands: config.executor.allowed_commands.clone(),
                blocked_commands: config.executor.blocked_commands.clone(),
            },
            process_host,
        ));
        let scheduler = Scheduler::new(Arc::clone(&clock));

        let mut subscriptions = Vec::new();
        let mut inboxes = HashMap::new();
        for kind in INBOUND_KINDS {
            let (tx, rx) = mpsc::channel(64);
            subscriptions.push(Subscription { kind: kind.to_string(), tx });
            inboxes.insert(kind, rx);
        }

        let connection = spawn_connection(
            ConnectionConfig {
                url: config.operator.url.clone(),
                agent: config.agent.clone(),
                connect_timeout: Duration::from_secs(10),
                reconnect_initial_backoff: Duration::from_secs(
                    config.operator.reconnect_initial_backoff_secs,
                ),
                reconnect_max_backoff: Duration::from_secs(
                    config.operator.reconnect_max_backoff_secs,
                ),
                reconnect_max_attempts: config.operator.reconnect_max_attempts,
                ping_interval: Duration::from_secs(config.operator.ping_interval_secs),
                ping_timeout: Duration::from_secs(config.operator.ping_timeout_secs),
                queue_capacity: 256,
            },
            subscriptions,
        );

        let this = Arc::new(Self {
            agent_id: config.agent.id.clone(),
            heartbeat_interval: Duration::from_secs(config.operator.heartbeat_interval_secs),
            metrics_interval: Duration::from_secs(config.telemetry.metrics_interval_secs.max(1)),
            report_system_metrics: config.telemetry.report_system_metrics,
            connection,
            executor,
            scheduler,
            metrics,
            metrics_cache: tokio::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for (kind, rx) in inboxes {
            handles.push(Arc::clone(&this).spawn_inbound_loop(kind, rx));
        }
        handles.push(Arc::clone(&this).spawn_heartbeat_loop());
        handles.push(Arc::clone(&this).spawn_metrics_sampling_loop());
        handles.push(Arc::clone(&this).spawn_scheduled_task_hook());

        let scheduler = Arc::clone(&this.scheduler);
        handles.push(tokio::spawn(async move {
            scheduler.start().await;
        }));

        this.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner).extend(handles);
        this
    }

    /// Stop every background driver and await their shutdown. Idempotent.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.connection.stop().await;
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
    }

    /// Wires the scheduler's fired-entry callback to `executor.submit`, so
    /// internally scheduled work (recurring or delayed) is dispatched the
    /// same way an inbound `task` envelope is.
    fn spawn_scheduled_task_hook(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(async move {
            scheduler
                .add_callback(move |entry| {
                    let executor = Arc::clone(&executor);
                    let task = Task {
                        task_id: Some(entry.task_id),
                        kind: entry.kind,
                        payload: entry.payload,
                        timeout: None,
                    };
                    tokio::spawn(async move {
                        executor.submit(task).await;
                    });
                })
                .await;
        })
    }

    fn spawn_inbound_loop(
        self: Arc<Self>,
        kind: &'static str,
        mut rx: mpsc::Receiver<Envelope>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let this = Arc::clone(&self);
                match kind {
                    "task" => this.handle_task(envelope).await,
                    "execute_task" => this.handle_execute_task(envelope).await,
                    "cancel" => this.handle_cancel(envelope).await,
                    "ping" => this.handle_ping(envelope),
                    "config" => this.handle_config(envelope),
                    "registered" => this.handle_registered(envelope),
                    _ => {}
                }
            }
        })
    }

    /// Refreshes the cached telemetry sample on its own cadence
    /// (`telemetry.metrics_interval_secs`), independent of how often
    /// heartbeats are sent. A no-op loop when `report_system_metrics` is
    /// disabled; the heartbeat loop then sends `telemetry: null`.
    fn spawn_metrics_sampling_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !self.report_system_metrics {
                return;
            }
            *self.metrics_cache.lock().await = Some(self.metrics.sample());
            let mut interval = tokio::time::interval(self.metrics_interval);
            interval.tick().await; // first tick fires immediately; we already sampled above
            loop {
                interval.tick().await;
                *self.metrics_cache.lock().await = Some(self.metrics.sample());
            }
        })
    }

    fn spawn_heartbeat_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.heartbeat_interval);
            loop {
                interval.tick().await;
                if !self.connection.is_connected() {
                    continue;
                }
                let running = self.executor.running().await;
                let scheduled_count = self.scheduler.list().await.len();
                let current_task_id = running.first().cloned();

                let telemetry = if self.report_system_metrics {
                    let metrics = self.metrics_cache.lock().await.clone();
                    let metrics = metrics.unwrap_or_else(|| self.metrics.sample());
                    json!({
                        "cpu_percent": metrics.cpu_percent,
                        "memory_percent": metrics.memory_percent,
                        "disk_percent": metrics.disk_percent,
                        "uptime_seconds": metrics.uptime_seconds,
                        "load_average": [metrics.load_average.0, metrics.load_average.1, metrics.load_average.2],
                    })
                } else {
                    Value::Null
                };

                let payload = json!({
                    "agent_id": self.agent_id,
                    "telemetry": telemetry,
                    "current_task_id": current_task_id,
                    "workspaces": Vec::<Value>::new(),
                    "scheduled_task_count": scheduled_count,
                });

                if let Err(e) = self.connection.send(Envelope::new("heartbeat", payload)) {
                    warn!(error = %e, "failed to enqueue heartbeat");
                } else {
                    debug!("sent heartbeat");
                }
            }
        })
    }

    async fn handle_task(&self, envelope: Envelope) {
        let task = Task::from_payload(&envelope.payload);
        let task_id = self.executor.submit(task).await;
        info!(task_id = %task_id, "submitted task");

        let executor = Arc::clone(&self.executor);
        let connection = self.connection.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(TASK_POLL_INTERVAL).await;
                let Some(result) = executor.result(&task_id).await else {
                    break;
                };
                if result.status.is_terminal() {
                    let _ = connection.send(Envelope::new("task_result", result.to_payload()));
                    break;
                }
            }
        });
    }

    async fn handle_execute_task(&self, envelope: Envelope) {
        let Some(task_id) = envelope.payload.get("task_id").and_then(Value::as_str) else {
            warn!("execute_task missing task_id, dropping");
            return;
        };
        let task_id = task_id.to_string();
        let commands: Vec<String> = envelope
            .payload
            .get("plan")
            .and_then(|p| p.get("commands"))
            .and_then(Value::as_array)
            .map(|cmds| {
                cmds.iter()
                    .filter_map(|c| c.get("run").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let executor = Arc::clone(&self.executor);
        let connection = self.connection.clone();

        tokio::spawn(async move {
            for (index, command) in commands.iter().enumerate() {
                let derived_id = format!("{task_id}-cmd-{index}");
                let mut payload = Map::new();
                payload.insert("command".to_string(), Value::String(command.clone()));
                let task = Task {
                    task_id: Some(derived_id.clone()),
                    kind: "shell".to_string(),
                    payload,
                    timeout: None,
                };
                executor.submit(task).await;

                let result = loop {
                    tokio::time::sleep(TASK_POLL_INTERVAL).await;
                    if let Some(result) = executor.result(&derived_id).await {
                        if result.status.is_terminal() {
                            break result;
                        }
                    }
                };

                let duration_ms = result.duration().unwrap_or(0.0) * 1000.0;
                let _ = connection.send(Envelope::new(
                    "command_result",
                    json!({
                        "task_id": task_id,
                        "command_index": index,
                        "command": command,
                        "exit_code": result.exit_code,
                        "duration_ms": duration_ms,
                    }),
                ));

                if !result.stdout.is_empty() {
                    let _ = connection.send(Envelope::new(
                        "task_output",
                        json!({
                            "task_id": task_id,
                            "command_index": index,
                            "stream": "stdout",
                            "content": result.stdout,
                        }),
                    ));
                }
                if !result.stderr.is_empty() {
                    let _ = connection.send(Envelope::new(
                        "task_output",
                        json!({
                            "task_id": task_id,
                            "command_index": index,
                            "stream": "stderr",
                            "content": result.stderr,
                        }),
                    ));
                }

                let exit_code = result.exit_code.unwrap_or(-1);
                if exit_code != 0 || result.status != TaskStatus::Completed {
                    let _ = connection.send(Envelope::new(
                        "task_complete",
                        json!({
                            "task_id": task_id,
                            "success": false,
                            "exit_code": exit_code,
                            "error": result.error,
                        }),
                    ));
                    return;
                }
            }

            let _ = connection.send(Envelope::new(
                "task_complete",
                json!({ "task_id": task_id, "success": true, "exit_code": 0 }),
            ));
        });
    }

    async fn handle_cancel(&self, envelope: Envelope) {
        let Some(task_id) = envelope.payload.get("task_id").and_then(Value::as_str) else {
            return;
        };
        let cancelled = self.executor.cancel(task_id).await;
        info!(task_id, cancelled, "processed cancel request");
    }

    /// The connection transport already answers every `ping` with a `pong`
    /// at the wire level; this handler only observes the traffic.
    fn handle_ping(&self, _envelope: Envelope) {
        debug!("operator ping observed");
    }

    /// Acknowledged but not applied: no live-reconfiguration semantics are
    /// defined for a running agent, so a `config` envelope is logged and
    /// otherwise ignored.
    fn handle_config(&self, envelope: Envelope) {
        info!(payload = ?envelope.payload, "received config envelope (not applied)");
    }

    fn handle_registered(&self, _envelope: Envelope) {
        info!("operator confirmed registration");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").field("agent_id", &self.agent_id).finish_non_exhaustive()
    }
}
