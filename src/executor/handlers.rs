//! Built-in task handlers for the executor's supported task kinds.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::process_host::{ProcessHost, ProcessSpec};

/// Fixed reason strings for blocked/malformed shell commands; kept stable
/// since operators may match on them.
pub const ERR_NO_COMMAND: &str = "No command provided";
pub const ERR_BLOCKED_COMMAND: &str = "Command blocked by security policy";
pub const ERR_NOT_ALLOWLISTED: &str = "Command not in allowlist";

/// What a handler hands back to the executor once it finishes on its own
/// (cancellation/timeout are imposed by the executor around this).
pub struct HandlerOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl HandlerOutcome {
    fn ok(exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        Self {
            success: true,
            exit_code,
            stdout,
            stderr,
            error: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(message.into()),
        }
    }
}

/// Collaborators and abort signal a handler invocation runs with.
pub struct HandlerContext {
    pub process_host: Arc<dyn ProcessHost>,
    pub allowed_commands: Arc<Vec<String>>,
    pub blocked_commands: Arc<Vec<String>>,
    pub abort: oneshot::Receiver<()>,
}

/// A routine implementing a task `kind`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, payload: Map<String, Value>, ctx: HandlerContext) -> HandlerOutcome;
}

fn is_blocked(command: &str, blocked: &[String]) -> bool {
    let lower = command.to_lowercase();
    blocked.iter().any(|b| lower.contains(&b.to_lowercase()))
}

/// Empty allowlist means "allow everything, subject to the blocklist".
fn is_allowed(command: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let lower = command.to_lowercase();
    allowed.iter().any(|a| lower.contains(&a.to_lowercase()))
}

fn string_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

fn string_map_field(payload: &Map<String, Value>, key: &str) -> Option<HashMap<String, String>> {
    payload.get(key)?.as_object().map(|m| {
        m.iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect()
    })
}

/// `shell` — run through the host's shell, subject to the blocklist.
pub struct ShellHandler;

#[async_trait]
impl Handler for ShellHandler {
    async fn run(&self, payload: Map<String, Value>, ctx: HandlerContext) -> HandlerOutcome {
        let Some(command) = string_field(&payload, "command").filter(|c| !c.trim().is_empty())
        else {
            return HandlerOutcome::failed(ERR_NO_COMMAND);
        };

        if !is_allowed(&command, &ctx.allowed_commands) {
            return HandlerOutcome::failed(ERR_NOT_ALLOWLISTED);
        }
        if is_blocked(&command, &ctx.blocked_commands) {
            return HandlerOutcome::failed(ERR_BLOCKED_COMMAND);
        }

        let mut spec = ProcessSpec::shell(&command);
        spec.cwd = string_field(&payload, "cwd");
        spec.env = string_map_field(&payload, "env");

        run_process(&ctx.process_host, spec, ctx.abort).await
    }
}

/// `script` — exec a path with args directly, no shell.
pub struct ScriptHandler;

#[async_trait]
impl Handler for ScriptHandler {
    async fn run(&self, payload: Map<String, Value>, ctx: HandlerContext) -> HandlerOutcome {
        let Some(path) = string_field(&payload, "path") else {
            return HandlerOutcome::failed("No script path provided");
        };
        let args = payload
            .get("args")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let mut spec = ProcessSpec::exec(&path, args);
        spec.cwd = string_field(&payload, "cwd");
        spec.env = string_map_field(&payload, "env");

        run_process(&ctx.process_host, spec, ctx.abort).await
    }
}

/// `python` — run a code string through the host's `python3`.
pub struct PythonHandler;

#[async_trait]
impl Handler for PythonHandler {
    async fn run(&self, payload: Map<String, Value>, ctx: HandlerContext) -> HandlerOutcome {
        let Some(code) = string_field(&payload, "code") else {
            return HandlerOutcome::failed("No code provided");
        };

        let spec = ProcessSpec::exec("python3", vec!["-c".to_string(), code]);
        run_process(&ctx.process_host, spec, ctx.abort).await
    }
}

/// `file_read` — UTF-8 read, full contents into `stdout`.
pub struct FileReadHandler;

#[async_trait]
impl Handler for FileReadHandler {
    async fn run(&self, payload: Map<String, Value>, _ctx: HandlerContext) -> HandlerOutcome {
        let Some(path) = string_field(&payload, "path") else {
            return HandlerOutcome::failed("No path provided");
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => HandlerOutcome::ok(Some(0), contents, String::new()),
            Err(e) => HandlerOutcome::failed(format!("failed to read {path}: {e}")),
        }
    }
}

/// `file_write` — UTF-8 write, reporting bytes written.
pub struct FileWriteHandler;

#[async_trait]
impl Handler for FileWriteHandler {
    async fn run(&self, payload: Map<String, Value>, _ctx: HandlerContext) -> HandlerOutcome {
        let Some(path) = string_field(&payload, "path") else {
            return HandlerOutcome::failed("No path provided");
        };
        let content = string_field(&payload, "content").unwrap_or_default();
        match tokio::fs::write(&path, &content).await {
            Ok(()) => HandlerOutcome::ok(
                Some(0),
                format!("Written {} bytes to {path}", content.len()),
                String::new(),
            ),
            Err(e) => HandlerOutcome::failed(format!("failed to write {path}: {e}")),
        }
    }
}

/// `service` — rewritten to `systemctl <action> <service>` and dispatched
/// through [`ShellHandler`] so the blocklist still applies.
pub struct ServiceHandler;

const SERVICE_ACTIONS: [&str; 6] = ["start", "stop", "restart", "status", "enable", "disable"];

#[async_trait]
impl Handler for ServiceHandler {
    async fn run(&self, payload: Map<String, Value>, ctx: HandlerContext) -> HandlerOutcome {
        let Some(service) = string_field(&payload, "service") else {
            return HandlerOutcome::failed("No service name provided");
        };
        let Some(action) = string_field(&payload, "action") else {
            return HandlerOutcome::failed("No service action provided");
        };
        if !SERVICE_ACTIONS.contains(&action.as_str()) {
            return HandlerOutcome::failed(format!("invalid service action: {action}"));
        }

        let command = format!("systemctl {action} {}", shell_quote(&service));
        let mut shell_payload = Map::new();
        shell_payload.insert("command".to_string(), Value::String(command));

        ShellHandler.run(shell_payload, ctx).await
    }
}

/// POSIX single-quote escaping, matching Python's `shlex.quote`.
fn shell_quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "-_./".contains(c)) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

async fn run_process(
    process_host: &Arc<dyn ProcessHost>,
    spec: ProcessSpec,
    abort: oneshot::Receiver<()>,
) -> HandlerOutcome {
    match process_host.run(spec, abort).await {
        Ok(output) => {
            let success = output.exit_code == Some(0);
            HandlerOutcome {
                success,
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
                error: if success {
                    None
                } else {
                    Some(format!("process exited with code {:?}", output.exit_code))
                },
            }
        }
        Err(e) => HandlerOutcome::failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_host::TokioProcessHost;

    fn ctx(blocked: Vec<&str>) -> HandlerContext {
        ctx_with_allowed(vec![], blocked)
    }

    fn ctx_with_allowed(allowed: Vec<&str>, blocked: Vec<&str>) -> HandlerContext {
        let (_tx, rx) = oneshot::channel();
        HandlerContext {
            process_host: Arc::new(TokioProcessHost),
            allowed_commands: Arc::new(allowed.into_iter().map(str::to_string).collect()),
            blocked_commands: Arc::new(blocked.into_iter().map(str::to_string).collect()),
            abort: rx,
        }
    }

    fn payload(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn shell_empty_command_is_rejected() {
        let outcome = ShellHandler.run(payload(&[]), ctx(vec![])).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some(ERR_NO_COMMAND));
    }

    #[tokio::test]
    async fn shell_blocked_command_is_rejected() {
        let outcome = ShellHandler
            .run(payload(&[("command", "rm -rf /")]), ctx(vec!["rm -rf /"]))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some(ERR_BLOCKED_COMMAND));
    }

    #[tokio::test]
    async fn shell_block_match_is_case_insensitive() {
        let outcome = ShellHandler
            .run(payload(&[("command", "RM -RF /")]), ctx(vec!["rm -rf /"]))
            .await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn shell_rejects_commands_outside_allowlist() {
        let outcome = ShellHandler
            .run(payload(&[("command", "cat /etc/passwd")]), ctx_with_allowed(vec!["echo"], vec![]))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some(ERR_NOT_ALLOWLISTED));
    }

    #[tokio::test]
    async fn shell_admits_commands_matching_allowlist() {
        let outcome = ShellHandler
            .run(payload(&[("command", "echo hi")]), ctx_with_allowed(vec!["echo"], vec![]))
            .await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn shell_runs_and_captures_stdout() {
        let outcome = ShellHandler
            .run(payload(&[("command", "echo hi")]), ctx(vec![]))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.stdout, "hi\n");
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn file_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt").to_string_lossy().into_owned();

        let write_outcome = FileWriteHandler
            .run(payload(&[("path", &path), ("content", "hello")]), ctx(vec![]))
            .await;
        assert!(write_outcome.success);
        assert_eq!(write_outcome.stdout, "Written 5 bytes to ".to_string() + &path);

        let read_outcome = FileReadHandler.run(payload(&[("path", &path)]), ctx(vec![])).await;
        assert!(read_outcome.success);
        assert_eq!(read_outcome.stdout, "hello");
    }

    #[tokio::test]
    async fn file_read_missing_path_fails() {
        let outcome = FileReadHandler
            .run(payload(&[("path", "/nonexistent/path/for/sure")]), ctx(vec![]))
            .await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn service_rejects_invalid_action() {
        let outcome = ServiceHandler
            .run(payload(&[("service", "nginx"), ("action", "explode")]), ctx(vec![]))
            .await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn service_delegates_through_shell_blocklist() {
        let outcome = ServiceHandler
            .run(
                payload(&[("service", "nginx"), ("action", "restart")]),
                ctx(vec!["systemctl restart nginx"]),
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some(ERR_BLOCKED_COMMAND));
    }

    #[test]
    fn shell_quote_wraps_special_characters() {
        assert_eq!(shell_quote("simple"), "simple");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
