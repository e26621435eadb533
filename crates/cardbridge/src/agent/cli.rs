use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::Error;
use crate::queue::AsyncQueue;

use super::events::AgentEvent;
use super::{AgentBackend, AgentRequest, AgentStream};

/// How much of the child's stderr is kept for error messages.
const STDERR_TAIL_BYTES: usize = 2000;

/// Runs the agent as a `claude -p` subprocess and streams its JSON lines.
pub struct ClaudeCliBackend {
    config: AgentConfig,
}

impl ClaudeCliBackend {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub(crate) fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--include-partial-messages".into(),
        ];
        if let Some(resume) = &request.resume {
            args.push("--resume".into());
            args.push(resume.clone());
        }
        if let Some(model) = &self.config.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if let Some(mode) = &self.config.permission_mode {
            args.push("--permission-mode".into());
            args.push(mode.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

impl AgentBackend for ClaudeCliBackend {
    fn open(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentStream, Error>> + Send + '_>> {
        Box::pin(async move {
            let args = self.build_args(&request);
            let mut child = tokio::process::Command::new(&self.config.command)
                .args(&args)
                .current_dir(&request.workspace)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    Error::Agent(format!("failed to spawn '{}': {e}", self.config.command))
                })?;

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::Agent("agent stdout was not captured".into()))?;

            tracing::debug!(
                command = %self.config.command,
                workspace = %request.workspace.display(),
                resume = request.resume.is_some(),
                "spawned agent process"
            );

            let queue = Arc::new(AsyncQueue::new());
            tokio::spawn(pump_output(
                child,
                stdout,
                Arc::clone(&queue),
                request.cancel.clone(),
            ));
            Ok(AgentStream::new(queue))
        })
    }
}

/// Read stdout line by line into the queue until EOF or cancellation.
async fn pump_output(
    mut child: Child,
    stdout: ChildStdout,
    queue: Arc<AsyncQueue<Result<AgentEvent, Error>>>,
    cancel: CancellationToken,
) {
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_tail(stderr)));

    let mut lines = BufReader::new(stdout).lines();
    let mut saw_result = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill cancelled agent process");
                }
                tracing::debug!("agent process cancelled");
                queue.finish();
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(event) = parse_line(&line) {
                        saw_result |= event.is_result();
                        queue.enqueue(Ok(event));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    queue.enqueue(Err(Error::Agent(format!("failed to read agent output: {e}"))));
                    break;
                }
            }
        }
    }

    let status = child.wait().await;
    let stderr_tail = match stderr_task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };
    match status {
        Ok(status) if !status.success() && !saw_result => {
            let detail = stderr_tail.trim();
            let message = if detail.is_empty() {
                format!("agent exited with {status}")
            } else {
                format!("agent exited with {status}: {detail}")
            };
            queue.enqueue(Err(Error::Agent(message)));
        }
        Ok(_) => {}
        Err(e) => {
            queue.enqueue(Err(Error::Agent(format!(
                "failed to wait for agent process: {e}"
            ))));
        }
    }
    queue.finish();
}

/// Parse one stdout line. Blank and malformed lines are skipped.
pub(crate) fn parse_line(line: &str) -> Option<AgentEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, line = %head(line, 200), "skipping unparseable agent output");
            None
        }
    }
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        tracing::debug!(error = %e, "failed to read agent stderr");
    }
    let text = String::from_utf8_lossy(&buf);
    tail(&text, STDERR_TAIL_BYTES).to_string()
}

/// The last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// The first `max` bytes of `text`, cut on a char boundary.
fn head(text: &str, max: usize) -> &str {
    &text[..crate::util::floor_char_boundary(text, max)]
}
