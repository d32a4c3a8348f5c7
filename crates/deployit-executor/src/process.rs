//! Local process executor implementation.

use async_trait::async_trait;
use chrono::Utc;
use deployit_core::executor::*;
use deployit_core::{Error, Result};
use std::collections::VecDeque;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of output kept per stream; older lines are dropped.
const MAX_CAPTURED_LINES: usize = 2000;

/// Runs commands as child processes of the worker.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessExecutor {
    /// Environment applied to every command before the spec's own env.
    base_env: Vec<(String, String)>,
}

impl LocalProcessExecutor {
    pub fn new() -> Self {
        Self {
            // Never block on an interactive credential prompt.
            base_env: vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())],
        }
    }

    /// Add an environment variable applied to every command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.base_env.push((key.into(), value.into()));
        self
    }

    fn command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(self.base_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Executor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn run(&self, spec: CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let command_line = spec.display();
        info!(command = %command_line, dir = ?spec.working_dir, "Running command");

        let started_at = Utc::now();
        let mut child = self
            .command(&spec)
            .spawn()
            .map_err(|e| Error::Internal(format!("failed to start `{}`: {}", spec.program, e)))?;

        let mut stdout = child.stdout.take().map(|s| capture(s, "stdout"));
        let mut stderr = child.stderr.take().map(|s| capture(s, "stderr"));

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let Some(status) = status else {
            warn!(command = %command_line, "Cancelling command");
            if let Err(e) = child.kill().await {
                warn!(command = %command_line, error = %e, "Failed to kill command");
            }
            abort_capture(stdout, stderr);
            return Err(Error::Cancelled);
        };
        let status =
            status.map_err(|e| Error::Internal(format!("waiting for `{command_line}`: {e}")))?;

        // A background process left behind by the command can keep the pipes
        // open after it exits.
        let collected = tokio::select! {
            output = async { (collect(&mut stdout).await, collect(&mut stderr).await) } => Some(output),
            _ = cancel.cancelled() => None,
        };
        let Some((stdout_text, stderr_text)) = collected else {
            warn!(command = %command_line, "Cancelled while reading command output");
            abort_capture(stdout, stderr);
            return Err(Error::Cancelled);
        };
        let exit_code = status.code();
        debug!(command = %command_line, ?exit_code, "Command finished");

        Ok(CommandOutput {
            exit_code,
            stdout: stdout_text,
            stderr: stderr_text,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Read a child stream line by line into a bounded buffer.
fn capture<R>(stream: R, name: &'static str) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut kept: VecDeque<String> = VecDeque::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(stream = name, "{}", line);
                    if kept.len() == MAX_CAPTURED_LINES {
                        kept.pop_front();
                    }
                    kept.push_back(line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(stream = name, error = %e, "Output stream error");
                    break;
                }
            }
        }
        kept.into_iter().collect::<Vec<_>>().join("\n")
    })
}

async fn collect(handle: &mut Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

fn abort_capture(stdout: Option<JoinHandle<String>>, stderr: Option<JoinHandle<String>>) {
    for handle in stdout.into_iter().chain(stderr) {
        handle.abort();
    }
}
