use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use uuid::Uuid;

use crate::agent::{AgentBackend, AgentRequest};
use crate::config::BridgeSection;
use crate::error::Error;
use crate::stream::{Snapshot, StreamProcessor, TaskStatus};

use super::artifacts::{
    collect_output_artifacts, deliver_output_artifacts, remove_staged, splice_image_prompt,
    stage_input_image,
};
use super::card::{Renderer, content_hash};
use super::commands::{Command, HELP_TEXT, resolve_workspace};
use super::limiter::RateLimiter;
use super::registry::{TaskRegistry, TaskTicket};
use super::session::SessionManager;
use super::transport::MessagingTransport;

/// A message from the chat platform.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Conversation key. One context and at most one task per key.
    pub context_id: String,
    /// Platform id of this message, used to fetch its attachment.
    pub message_id: String,
    pub text: String,
    /// Attachment key when the message carries an image.
    pub image_key: Option<String>,
}

impl InboundMessage {
    pub fn new(
        context_id: impl Into<String>,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            message_id: message_id.into(),
            text: text.into(),
            image_key: None,
        }
    }
}

/// Why a task was not started. Shown to the user as a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejection {
    NoWorkspace,
    Busy,
}

impl fmt::Display for AdmissionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionRejection::NoWorkspace => {
                write!(f, "No workspace set. Use /cd <path> to choose one first.")
            }
            AdmissionRejection::Busy => write!(
                f,
                "A task is already running here. Wait for it to finish or send /stop."
            ),
        }
    }
}

/// What became of one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// Handled as a slash command.
    Command,
    Rejected(AdmissionRejection),
    /// The task ran to an end; carries the final snapshot that was rendered.
    Finished(Snapshot),
    /// The task was admitted but could not start (no card to update).
    Aborted,
}

/// Removes the task's registry entry when the run ends, however it ends.
struct TaskGuard<'a> {
    tasks: &'a TaskRegistry,
    key: &'a str,
    id: Uuid,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.tasks.remove(self.key, self.id);
    }
}

/// Per-run state threaded through the drive loop.
struct TaskRun<'a> {
    key: &'a str,
    workspace: &'a Path,
    message_id: &'a str,
    processor: StreamProcessor,
    limiter: RateLimiter,
    last_hash: u64,
}

/// Admits tasks, drives the agent stream and keeps the task's card current.
///
/// All shared state is injected, so several orchestrators can live in one
/// process without touching each other.
pub struct TaskOrchestrator {
    sessions: Arc<SessionManager>,
    tasks: Arc<TaskRegistry>,
    backend: Arc<dyn AgentBackend>,
    transport: Arc<dyn MessagingTransport>,
    renderer: Arc<dyn Renderer>,
    config: BridgeSection,
}

impl TaskOrchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        tasks: Arc<TaskRegistry>,
        backend: Arc<dyn AgentBackend>,
        transport: Arc<dyn MessagingTransport>,
        renderer: Arc<dyn Renderer>,
        config: BridgeSection,
    ) -> Self {
        Self {
            sessions,
            tasks,
            backend,
            transport,
            renderer,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    /// Start background housekeeping (context eviction).
    pub fn start(&self) {
        self.sessions.start_sweep();
    }

    /// Route one inbound message: commands are answered, anything else runs
    /// as an agent task. Returns once the task (if any) has fully ended.
    pub async fn handle_message(&self, message: InboundMessage) -> MessageOutcome {
        if let Some(command) = Command::parse(&message.text) {
            self.handle_command(&message.context_id, command).await;
            return MessageOutcome::Command;
        }
        self.run_task(message).await
    }

    async fn run_task(&self, message: InboundMessage) -> MessageOutcome {
        let key = message.context_id.as_str();

        let workspace = match self.sessions.workspace(key) {
            Ok(Some(workspace)) => workspace,
            Ok(None) => return self.reject(key, AdmissionRejection::NoWorkspace).await,
            Err(e) => {
                tracing::error!(context_id = key, error = %e, "session lookup failed");
                return MessageOutcome::Aborted;
            }
        };
        let Some(ticket) = self.tasks.try_register(key) else {
            return self.reject(key, AdmissionRejection::Busy).await;
        };
        let guard = TaskGuard {
            tasks: &self.tasks,
            key,
            id: ticket.id,
        };
        let resume = self.sessions.session_handle(key).unwrap_or_else(|e| {
            tracing::warn!(context_id = key, error = %e, "could not read session handle");
            None
        });

        tracing::info!(
            context_id = key,
            task_id = %ticket.id,
            workspace = %workspace.display(),
            resume = resume.is_some(),
            "task admitted"
        );

        let initial = self.renderer.render(&Snapshot::thinking(&message.text));
        let message_id = match self.transport.send_render(key, &initial).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(context_id = key, error = %e, "failed to send initial card");
                drop(guard);
                return MessageOutcome::Aborted;
            }
        };

        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = spawn_timeout(&ticket, self.config.task_timeout(), Arc::clone(&timed_out));

        let staged = match &message.image_key {
            Some(image_key) => {
                stage_input_image(
                    self.transport.as_ref(),
                    &self.config.scratch_dir,
                    &message.message_id,
                    image_key,
                )
                .await
            }
            None => None,
        };
        let prompt = match &message.image_key {
            Some(_) => splice_image_prompt(&message.text, staged.as_deref()),
            None => message.text.clone(),
        };

        let mut run = TaskRun {
            key,
            workspace: &workspace,
            message_id: &message_id,
            processor: StreamProcessor::new(message.text.clone()),
            limiter: RateLimiter::new(self.config.render_interval()),
            last_hash: content_hash(&initial),
        };
        let request = AgentRequest {
            prompt,
            workspace: workspace.clone(),
            resume,
            cancel: ticket.cancel.clone(),
        };
        let driven = self.drive(&mut run, request, &ticket).await;

        let final_snapshot = match driven {
            Err(e) => {
                tracing::warn!(context_id = key, error = %e, "agent run failed");
                run.processor.finish_with_error(e.to_string())
            }
            Ok(()) if ticket.cancel.is_cancelled() => {
                let reason = if timed_out.load(Ordering::SeqCst) {
                    format!("Timed out after {}s", self.config.task_timeout_seconds)
                } else {
                    "Stopped".to_string()
                };
                tracing::info!(context_id = key, reason = %reason, "task cancelled");
                run.processor.finish_with_error(reason)
            }
            Ok(()) => run.processor.finish(),
        };

        run.limiter.flush().await;
        let content = self.renderer.render(&final_snapshot);
        self.update_card(&message_id, &content).await;
        timer.abort();
        drop(guard);

        if let Some(path) = &staged {
            remove_staged(path).await;
        }

        let artifacts =
            collect_output_artifacts(run.processor.image_paths(), &final_snapshot.response_text);
        if !artifacts.is_empty() {
            let sent = deliver_output_artifacts(
                self.transport.as_ref(),
                key,
                &artifacts,
                self.config.max_artifact_bytes,
            )
            .await;
            tracing::debug!(context_id = key, found = artifacts.len(), sent, "delivered artifacts");
        }

        tracing::info!(context_id = key, status = ?final_snapshot.status, "task finished");
        MessageOutcome::Finished(final_snapshot)
    }

    /// Pull events until the stream ends or the task is cancelled.
    ///
    /// Cancellation is not an error here; the caller decides how to report it.
    async fn drive(
        &self,
        run: &mut TaskRun<'_>,
        request: AgentRequest,
        ticket: &TaskTicket,
    ) -> Result<(), Error> {
        let mut stream = self.backend.open(request).await?;
        let mut persisted: Option<String> = None;
        let mut was_waiting = false;

        loop {
            let item = tokio::select! {
                biased;
                _ = ticket.cancel.cancelled() => break,
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let snapshot = run.processor.process_event(&item?);

            if let Some(session_id) = run.processor.session_id()
                && persisted.as_deref() != Some(session_id)
            {
                self.persist_session(run.key, run.workspace, session_id);
                persisted = Some(session_id.to_string());
            }

            if snapshot.status.is_terminal() {
                continue;
            }

            let content = self.renderer.render(&snapshot);
            let hash = content_hash(&content);
            if hash == run.last_hash {
                continue;
            }
            run.last_hash = hash;

            let waiting = snapshot.status == TaskStatus::WaitingForInput;
            if waiting && !was_waiting {
                // A stale throttled frame must not land on top of the question.
                tokio::select! {
                    biased;
                    _ = ticket.cancel.cancelled() => break,
                    _ = run.limiter.cancel_and_wait() => {}
                }
                self.update_card(run.message_id, &content).await;
            } else {
                let transport = Arc::clone(&self.transport);
                let message_id = run.message_id.to_string();
                run.limiter.schedule(move || async move {
                    if let Err(e) = transport.update_render(&message_id, &content).await {
                        tracing::warn!(message_id = %message_id, error = %e, "throttled card update failed");
                    }
                });
            }
            was_waiting = waiting;
        }
        Ok(())
    }

    fn persist_session(&self, key: &str, workspace: &Path, session_id: &str) {
        match self
            .sessions
            .set_session_handle_if_workspace(key, workspace, session_id)
        {
            Ok(true) => tracing::debug!(context_id = key, session_id, "session handle stored"),
            Ok(false) => tracing::debug!(
                context_id = key,
                "workspace changed during task, session handle not stored"
            ),
            Err(e) => tracing::warn!(context_id = key, error = %e, "failed to store session handle"),
        }
    }

    async fn reject(&self, key: &str, rejection: AdmissionRejection) -> MessageOutcome {
        tracing::debug!(context_id = key, ?rejection, "task rejected");
        self.reply(key, &rejection.to_string()).await;
        MessageOutcome::Rejected(rejection)
    }

    async fn handle_command(&self, key: &str, command: Command) {
        tracing::debug!(context_id = key, ?command, "command");
        let reply = match command {
            Command::Help => HELP_TEXT.to_string(),
            Command::Cd(arg) => self.change_workspace(key, &arg).await,
            Command::Reset => match self.sessions.reset_session(key) {
                Ok(()) => "Session cleared. The next message starts a fresh conversation.".into(),
                Err(e) => format!("Could not reset: {e}"),
            },
            Command::Stop => {
                if self.tasks.cancel(key) {
                    "Stopping the running task.".into()
                } else {
                    "Nothing to stop.".into()
                }
            }
            Command::Status => self.status_text(key),
            Command::Unknown(word) => format!("Unknown command {word}. Send /help for the list."),
        };
        self.reply(key, &reply).await;
    }

    async fn change_workspace(&self, key: &str, arg: &str) -> String {
        let current: Option<PathBuf> = self.sessions.workspace(key).unwrap_or(None);
        let path = match resolve_workspace(arg, current.as_deref()).await {
            Ok(path) => path,
            Err(Error::Validation(msg)) => return msg,
            Err(e) => return e.to_string(),
        };
        match self.sessions.set_workspace(key, &path) {
            Ok(true) => format!(
                "Workspace set to {}. The previous session was cleared.",
                path.display()
            ),
            Ok(false) => format!("Workspace set to {}.", path.display()),
            Err(e) => format!("Could not change workspace: {e}"),
        }
    }

    fn status_text(&self, key: &str) -> String {
        let info = match self.sessions.get_or_create(key) {
            Ok(info) => info,
            Err(e) => return format!("Status unavailable: {e}"),
        };
        let workspace = info
            .workspace
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".into());
        let session = info.session_handle.as_deref().unwrap_or("(new)");
        let task = match self.tasks.elapsed(key) {
            Some(elapsed) => format!("running for {}s", elapsed.as_secs()),
            None => "idle".into(),
        };
        let age = (Utc::now() - info.created_at).num_minutes();
        format!("Workspace: {workspace}\nSession: {session}\nTask: {task}\nContext age: {age}m")
    }

    async fn reply(&self, key: &str, text: &str) {
        if let Err(e) = self.transport.send_text(key, text).await {
            tracing::warn!(context_id = key, error = %e, "failed to send reply");
        }
    }

    async fn update_card(&self, message_id: &str, content: &str) {
        if let Err(e) = self.transport.update_render(message_id, content).await {
            tracing::warn!(message_id, error = %e, "failed to update card");
        }
    }

    /// Cancel every running task and stop the session sweep.
    pub fn shutdown(&self) {
        let cancelled = self.tasks.cancel_all();
        self.sessions.destroy();
        tracing::info!(cancelled, "orchestrator shut down");
    }
}

/// Cancel the task when it overruns `timeout`. Ends early if the task does.
fn spawn_timeout(
    ticket: &TaskTicket,
    timeout: std::time::Duration,
    timed_out: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    let cancel = ticket.cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::{Value, json};

    use crate::agent::AgentStream;
    use crate::agent::events::AgentEvent;
    use crate::channel::card::CardRenderer;
    use crate::channel::transport::TransportFuture;
    use crate::queue::AsyncQueue;

    use super::*;

    /// Replays fixed events; optionally holds the stream open until cancelled.
    struct ScriptedBackend {
        events: Vec<Value>,
        hang: bool,
        requests: Mutex<Vec<AgentRequest>>,
    }

    impl ScriptedBackend {
        fn new(events: Vec<Value>) -> Self {
            Self {
                events,
                hang: false,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn hanging(events: Vec<Value>) -> Self {
            Self {
                hang: true,
                ..Self::new(events)
            }
        }
    }

    impl AgentBackend for ScriptedBackend {
        fn open(
            &self,
            request: AgentRequest,
        ) -> Pin<Box<dyn Future<Output = Result<AgentStream, Error>> + Send + '_>> {
            Box::pin(async move {
                let queue = Arc::new(AsyncQueue::new());
                for event in &self.events {
                    let event: AgentEvent = serde_json::from_value(event.clone())?;
                    queue.enqueue(Ok(event));
                }
                if self.hang {
                    let queue = Arc::clone(&queue);
                    let cancel = request.cancel.clone();
                    tokio::spawn(async move {
                        cancel.cancelled().await;
                        queue.finish();
                    });
                } else {
                    queue.finish();
                }
                self.requests.lock().unwrap().push(request);
                Ok(AgentStream::new(queue))
            })
        }
    }

    struct FailingBackend;

    impl AgentBackend for FailingBackend {
        fn open(
            &self,
            _request: AgentRequest,
        ) -> Pin<Box<dyn Future<Output = Result<AgentStream, Error>> + Send + '_>> {
            Box::pin(async { Err(Error::Agent("failed to spawn 'claude'".into())) })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Send(String),
        Update(Value),
        Text(String),
    }

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn texts(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Text(t) => Some(t),
                    _ => None,
                })
                .collect()
        }

        fn updates(&self) -> Vec<Value> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Update(v) => Some(v),
                    _ => None,
                })
                .collect()
        }
    }

    impl MessagingTransport for RecordingTransport {
        fn send_render<'a>(&'a self, _: &'a str, content: &'a str) -> TransportFuture<'a, String> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(Call::Send(content.to_string()));
                Ok("card-1".to_string())
            })
        }

        fn update_render<'a>(&'a self, _: &'a str, content: &'a str) -> TransportFuture<'a, ()> {
            Box::pin(async move {
                let value: Value = serde_json::from_str(content)?;
                self.calls.lock().unwrap().push(Call::Update(value));
                Ok(())
            })
        }

        fn send_text<'a>(&'a self, _: &'a str, text: &'a str) -> TransportFuture<'a, ()> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(Call::Text(text.to_string()));
                Ok(())
            })
        }

        fn download_input_artifact<'a>(
            &'a self,
            _: &'a str,
            _: &'a str,
            _: &'a Path,
        ) -> TransportFuture<'a, ()> {
            Box::pin(async { Err(Error::Transport("no attachments".into())) })
        }

        fn upload_artifact<'a>(&'a self, _: &'a Path) -> TransportFuture<'a, String> {
            Box::pin(async { Err(Error::Transport("no uploads".into())) })
        }

        fn send_artifact_message<'a>(&'a self, _: &'a str, _: &'a str) -> TransportFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    fn config(workspace: Option<&Path>) -> BridgeSection {
        BridgeSection {
            default_workspace: workspace.map(Path::to_path_buf),
            task_timeout_seconds: 30,
            render_interval_ms: 100,
            ..BridgeSection::default()
        }
    }

    fn orchestrator(
        backend: Arc<dyn AgentBackend>,
        transport: Arc<RecordingTransport>,
        config: BridgeSection,
    ) -> TaskOrchestrator {
        TaskOrchestrator::new(
            Arc::new(SessionManager::from_config(&config)),
            Arc::new(TaskRegistry::new()),
            backend,
            transport,
            Arc::new(CardRenderer),
            config,
        )
    }

    fn init(session: &str) -> Value {
        json!({"type": "system", "subtype": "init", "session_id": session})
    }

    fn success(text: &str) -> Value {
        json!({
            "type": "result", "subtype": "success", "is_error": false,
            "duration_ms": 900, "total_cost_usd": 0.01, "result": text,
            "session_id": "sess-1"
        })
    }

    fn finished(outcome: MessageOutcome) -> Snapshot {
        match outcome {
            MessageOutcome::Finished(snapshot) => snapshot,
            other => panic!("expected a finished task, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_run_stores_session_and_renders_final_card() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            init("sess-1"),
            json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "Looking"}]}}),
            success("All done"),
        ]));
        let transport = Arc::new(RecordingTransport::default());
        let orch = orchestrator(backend.clone(), transport.clone(), config(Some(Path::new("/w"))));

        let snapshot = finished(orch.handle_message(InboundMessage::new("k", "m1", "hi")).await);
        assert_eq!(snapshot.status, TaskStatus::Complete);
        assert_eq!(snapshot.response_text, "All done");

        assert_eq!(orch.sessions().session_handle("k").unwrap().as_deref(), Some("sess-1"));
        assert!(orch.tasks().is_empty());

        let updates = transport.updates();
        assert_eq!(updates.last().unwrap()["status"], "complete");
        assert_eq!(
            updates.iter().filter(|u| u["status"] == "complete").count(),
            1
        );
        assert!(matches!(transport.calls()[0], Call::Send(_)));
    }

    fn text_delta(text: &str) -> Value {
        json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": text}
            },
            "parent_tool_use_id": null
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_deltas_collapses_into_few_updates() {
        let mut events: Vec<Value> = (0..50).map(|i| text_delta(&format!("w{i} "))).collect();
        events.push(success("All done"));
        let backend = Arc::new(ScriptedBackend::new(events));
        let transport = Arc::new(RecordingTransport::default());
        let cfg = BridgeSection {
            render_interval_ms: 1000,
            ..config(Some(Path::new("/w")))
        };
        let orch = orchestrator(backend, transport.clone(), cfg);

        let snapshot = finished(orch.handle_message(InboundMessage::new("k", "m1", "hi")).await);
        assert_eq!(snapshot.status, TaskStatus::Complete);

        let updates = transport.updates();
        assert!(updates.len() <= 3, "expected throttled updates, got {}", updates.len());
        assert_eq!(updates.last().unwrap()["status"], "complete");
        assert_eq!(
            updates.iter().filter(|u| u["status"] == "complete").count(),
            1
        );
        // The flushed frame before the final one carries the latest text.
        let before_final = &updates[updates.len() - 2];
        assert_eq!(before_final["status"], "running");
        assert!(before_final.to_string().contains("w49"));
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_stored_session() {
        let backend = Arc::new(ScriptedBackend::new(vec![success("ok")]));
        let transport = Arc::new(RecordingTransport::default());
        let orch = orchestrator(backend.clone(), transport, config(Some(Path::new("/w"))));
        orch.sessions().set_session_handle("k", "sess-prev").unwrap();

        orch.handle_message(InboundMessage::new("k", "m1", "continue")).await;
        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].resume.as_deref(), Some("sess-prev"));
        assert_eq!(requests[0].workspace, PathBuf::from("/w"));
        assert_eq!(requests[0].prompt, "continue");
    }

    #[tokio::test(start_paused = true)]
    async fn no_workspace_is_rejected() {
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let transport = Arc::new(RecordingTransport::default());
        let orch = orchestrator(backend.clone(), transport.clone(), config(None));

        let outcome = orch.handle_message(InboundMessage::new("k", "m1", "hi")).await;
        assert_eq!(outcome, MessageOutcome::Rejected(AdmissionRejection::NoWorkspace));
        assert!(orch.tasks().is_empty());
        assert!(backend.requests.lock().unwrap().is_empty());
        assert!(transport.texts()[0].contains("/cd"));
    }

    #[tokio::test(start_paused = true)]
    async fn backend_error_becomes_error_card() {
        let transport = Arc::new(RecordingTransport::default());
        let orch = orchestrator(
            Arc::new(FailingBackend),
            transport.clone(),
            config(Some(Path::new("/w"))),
        );
        let snapshot = finished(orch.handle_message(InboundMessage::new("k", "m1", "hi")).await);
        assert_eq!(snapshot.status, TaskStatus::Error);
        assert!(snapshot.error_message.unwrap().contains("failed to spawn"));
        assert_eq!(transport.updates().last().unwrap()["status"], "error");
        assert!(orch.tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_and_reports() {
        let backend = Arc::new(ScriptedBackend::hanging(vec![init("sess-1")]));
        let transport = Arc::new(RecordingTransport::default());
        let orch = orchestrator(backend, transport.clone(), config(Some(Path::new("/w"))));

        let snapshot = finished(orch.handle_message(InboundMessage::new("k", "m1", "hi")).await);
        assert_eq!(snapshot.status, TaskStatus::Error);
        assert_eq!(snapshot.error_message.as_deref(), Some("Timed out after 30s"));
        assert!(orch.tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_command_cancels_running_task() {
        let backend = Arc::new(ScriptedBackend::hanging(vec![init("sess-1")]));
        let transport = Arc::new(RecordingTransport::default());
        let orch = Arc::new(orchestrator(
            backend,
            transport.clone(),
            config(Some(Path::new("/w"))),
        ));

        let running = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.handle_message(InboundMessage::new("k", "m1", "hi")).await })
        };
        while !orch.tasks().is_running("k") {
            tokio::task::yield_now().await;
        }

        let busy = orch.handle_message(InboundMessage::new("k", "m2", "again")).await;
        assert_eq!(busy, MessageOutcome::Rejected(AdmissionRejection::Busy));

        orch.handle_message(InboundMessage::new("k", "m3", "/stop")).await;
        let snapshot = finished(running.await.unwrap());
        assert_eq!(snapshot.error_message.as_deref(), Some("Stopped"));
        assert!(orch.tasks().is_empty());
        assert!(transport.texts().iter().any(|t| t == "Stopping the running task."));
    }

    #[tokio::test(start_paused = true)]
    async fn question_is_rendered_immediately() {
        let backend = Arc::new(ScriptedBackend::hanging(vec![
            json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "Need input"}]}}),
            json!({"type": "assistant", "message": {"content": [{
                "type": "tool_use", "id": "q1", "name": "AskUserQuestion",
                "input": {"questions": [{"question": "Which?", "header": "Pick", "options": [], "multiSelect": false}]}
            }]}}),
        ]));
        let transport = Arc::new(RecordingTransport::default());
        let orch = Arc::new(orchestrator(
            backend,
            transport.clone(),
            config(Some(Path::new("/w"))),
        ));

        let running = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.handle_message(InboundMessage::new("k", "m1", "go")).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        let updates = transport.updates();
        assert_eq!(updates.last().unwrap()["status"], "waiting_for_input");

        orch.shutdown();
        let snapshot = finished(running.await.unwrap());
        assert_eq!(snapshot.status, TaskStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_seen_while_waiting_to_show_question() {
        let backend = Arc::new(ScriptedBackend::hanging(vec![
            json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "Need input"}]}}),
            json!({"type": "assistant", "message": {"content": [{
                "type": "tool_use", "id": "q1", "name": "AskUserQuestion",
                "input": {"questions": [{"question": "Which?", "header": "Pick", "options": [], "multiSelect": false}]}
            }]}}),
        ]));
        let transport = Arc::new(RecordingTransport::default());
        // The render window outlasts the task timeout.
        let cfg = BridgeSection {
            render_interval_ms: 120_000,
            ..config(Some(Path::new("/w")))
        };
        let orch = orchestrator(backend, transport.clone(), cfg);

        let started = tokio::time::Instant::now();
        let snapshot = finished(orch.handle_message(InboundMessage::new("k", "m1", "go")).await);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(snapshot.error_message.as_deref(), Some("Timed out after 30s"));
        assert!(
            transport
                .updates()
                .iter()
                .all(|u| u["status"] != "waiting_for_input")
        );
        assert!(orch.tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_card_aborts_and_frees_slot() {
        struct DeadTransport;
        impl MessagingTransport for DeadTransport {
            fn send_render<'a>(&'a self, _: &'a str, _: &'a str) -> TransportFuture<'a, String> {
                Box::pin(async { Err(Error::Transport("503".into())) })
            }
            fn update_render<'a>(&'a self, _: &'a str, _: &'a str) -> TransportFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }
            fn send_text<'a>(&'a self, _: &'a str, _: &'a str) -> TransportFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }
            fn download_input_artifact<'a>(
                &'a self,
                _: &'a str,
                _: &'a str,
                _: &'a Path,
            ) -> TransportFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }
            fn upload_artifact<'a>(&'a self, _: &'a Path) -> TransportFuture<'a, String> {
                Box::pin(async { Ok(String::new()) })
            }
            fn send_artifact_message<'a>(&'a self, _: &'a str, _: &'a str) -> TransportFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }
        }

        let backend = Arc::new(ScriptedBackend::new(vec![success("ok")]));
        let cfg = config(Some(Path::new("/w")));
        let orch = TaskOrchestrator::new(
            Arc::new(SessionManager::from_config(&cfg)),
            Arc::new(TaskRegistry::new()),
            backend.clone(),
            Arc::new(DeadTransport),
            Arc::new(CardRenderer),
            cfg,
        );
        let outcome = orch.handle_message(InboundMessage::new("k", "m1", "hi")).await;
        assert_eq!(outcome, MessageOutcome::Aborted);
        assert!(orch.tasks().is_empty());
        assert!(backend.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cd_validates_and_clears_session() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let orch = orchestrator(
            Arc::new(ScriptedBackend::new(vec![])),
            transport.clone(),
            config(Some(dir.path())),
        );
        orch.sessions().set_session_handle("k", "sess-1").unwrap();

        let missing = dir.path().join("missing");
        orch.handle_message(InboundMessage::new("k", "m1", format!("/cd {}", missing.display())))
            .await;
        assert!(transport.texts()[0].contains("no such directory"));
        assert_eq!(orch.sessions().session_handle("k").unwrap().as_deref(), Some("sess-1"));

        std::fs::create_dir(dir.path().join("app")).unwrap();
        orch.handle_message(InboundMessage::new("k", "m2", "/CD app")).await;
        assert!(transport.texts()[1].contains("previous session was cleared"));
        assert!(orch.sessions().session_handle("k").unwrap().is_none());
        assert_eq!(
            orch.sessions().workspace("k").unwrap(),
            Some(dir.path().join("app").canonicalize().unwrap())
        );
    }

    #[tokio::test]
    async fn simple_commands_reply() {
        let transport = Arc::new(RecordingTransport::default());
        let orch = orchestrator(
            Arc::new(ScriptedBackend::new(vec![])),
            transport.clone(),
            config(Some(Path::new("/w"))),
        );
        orch.sessions().set_session_handle("k", "sess-1").unwrap();

        for text in ["/help", "/stop", "/status", "/reset", "/nope"] {
            let outcome = orch.handle_message(InboundMessage::new("k", "m", text)).await;
            assert_eq!(outcome, MessageOutcome::Command);
        }
        let texts = transport.texts();
        assert!(texts[0].contains("/cd <path>"));
        assert_eq!(texts[1], "Nothing to stop.");
        assert!(texts[2].contains("Workspace: /w"));
        assert!(texts[2].contains("Session: sess-1"));
        assert!(texts[2].contains("Task: idle"));
        assert!(texts[3].contains("Session cleared"));
        assert!(texts[4].contains("Unknown command /nope"));
        assert!(orch.sessions().session_handle("k").unwrap().is_none());
        assert_eq!(orch.sessions().workspace("k").unwrap(), Some(PathBuf::from("/w")));
    }
}
