//! `ProcessHost` — injected child-process spawn/wait/terminate collaborator.
//! The executor's built-in handlers go through this trait so that
//! timeout/cancellation tests don't need to launch real shells.
//!
//! `Stdio` plumbing, explicit kill-then-wait on teardown, `Child::try_wait`
//! for non-blocking liveness checks.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// A command to run: either through a shell (`shell`) or exec'd directly
/// (`script`/`python`).
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub use_shell: bool,
}

impl ProcessSpec {
    #[must_use]
    pub fn shell(command: &str) -> Self {
        Self {
            program: shell_program(),
            args: vec!["-c".to_string(), command.to_string()],
            cwd: None,
            env: None,
            use_shell: true,
        }
    }

    #[must_use]
    pub fn exec(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
            cwd: None,
            env: None,
            use_shell: false,
        }
    }
}

#[cfg(unix)]
fn shell_program() -> String {
    "/bin/sh".to_string()
}

#[cfg(not(unix))]
fn shell_program() -> String {
    "cmd".to_string()
}

/// Output captured from a finished process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Spawns, waits on, and terminates child processes.
#[async_trait]
pub trait ProcessHost: Send + Sync + 'static {
    /// Run `spec` to completion, or until `abort` resolves, killing the
    /// child with a terminal signal if aborted. Leaving an orphaned child
    /// process behind is treated as a defect.
    async fn run(
        &self,
        spec: ProcessSpec,
        abort: tokio::sync::oneshot::Receiver<()>,
    ) -> std::io::Result<ProcessOutput>;
}

/// Real implementation backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessHost;

#[async_trait]
impl ProcessHost for TokioProcessHost {
    async fn run(
        &self,
        spec: ProcessSpec,
        mut abort: tokio::sync::oneshot::Receiver<()>,
    ) -> std::io::Result<ProcessOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &spec.env {
            cmd.env_clear();
            cmd.envs(env);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                Ok(ProcessOutput {
                    exit_code: status.code(),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                })
            }
            _ = &mut abort => {
                child.start_kill()?;
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "process aborted",
                ))
            }
        }
    }
}
