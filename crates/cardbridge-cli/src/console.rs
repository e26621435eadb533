use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cardbridge::channel::Command;
use cardbridge::{
    Error, InboundMessage, MessageOutcome, MessagingTransport, TaskOrchestrator, TransportFuture,
};
use tokio::task::JoinSet;

/// Terminal stand-in for a chat platform.
///
/// Cards are printed as pretty JSON on stdout. Attachments are local files:
/// an inbound image key is a path to copy, and an uploaded artifact's key is
/// its own path.
#[derive(Default)]
pub struct ConsoleTransport {
    next_id: AtomicU64,
}

impl ConsoleTransport {
    fn print_card(&self, label: &str, message_id: &str, content: &str) -> Result<(), Error> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        let pretty = serde_json::to_string_pretty(&value)?;
        println!("── {label} {message_id} ──\n{pretty}");
        Ok(())
    }
}

impl MessagingTransport for ConsoleTransport {
    fn send_render<'a>(&'a self, _context_id: &'a str, content: &'a str) -> TransportFuture<'a, String> {
        Box::pin(async move {
            let id = format!("card-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
            self.print_card("new", &id, content)?;
            Ok(id)
        })
    }

    fn update_render<'a>(&'a self, message_id: &'a str, content: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move { self.print_card("update", message_id, content) })
    }

    fn send_text<'a>(&'a self, _context_id: &'a str, text: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            println!("{text}");
            Ok(())
        })
    }

    fn download_input_artifact<'a>(
        &'a self,
        _message_id: &'a str,
        artifact_key: &'a str,
        dest: &'a Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            tokio::fs::copy(artifact_key, dest).await.map_err(|e| {
                Error::Transport(format!("failed to copy attachment {artifact_key}: {e}"))
            })?;
            Ok(())
        })
    }

    fn upload_artifact<'a>(&'a self, path: &'a Path) -> TransportFuture<'a, String> {
        Box::pin(async move { Ok(path.display().to_string()) })
    }

    fn send_artifact_message<'a>(
        &'a self,
        _context_id: &'a str,
        artifact_key: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            println!("[image] {artifact_key}");
            Ok(())
        })
    }
}

/// Split an optional `@<path>` attachment off the front of an input line.
pub fn split_attachment(line: &str) -> (Option<String>, String) {
    let line = line.trim();
    match line.strip_prefix('@') {
        Some(rest) => {
            let (path, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            (Some(path.to_string()), text.trim().to_string())
        }
        None => (None, line.to_string()),
    }
}

/// Hand one message to the orchestrator.
///
/// Commands run inline so the next line already sees their effect (a `/cd`
/// lands before the task typed after it). Agent tasks run in `tasks`.
pub async fn dispatch(
    orchestrator: &Arc<TaskOrchestrator>,
    tasks: &mut JoinSet<MessageOutcome>,
    message: InboundMessage,
) {
    if Command::parse(&message.text).is_some() {
        orchestrator.handle_message(message).await;
        return;
    }
    let orchestrator = Arc::clone(orchestrator);
    tasks.spawn(async move { orchestrator.handle_message(message).await });
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use cardbridge::{
        AgentBackend, AgentEvent, AgentRequest, AgentStream, AsyncQueue, BridgeSection,
        CardRenderer, SessionManager, TaskRegistry,
    };
    use serde_json::json;

    use super::*;

    /// Finishes every run with a single success result.
    struct DoneBackend;

    impl AgentBackend for DoneBackend {
        fn open(
            &self,
            _request: AgentRequest,
        ) -> Pin<Box<dyn Future<Output = Result<AgentStream, Error>> + Send + '_>> {
            Box::pin(async {
                let event: AgentEvent = serde_json::from_value(json!({
                    "type": "result", "subtype": "success", "is_error": false,
                    "duration_ms": 10, "total_cost_usd": 0.0, "result": "done",
                    "session_id": "sess-1"
                }))?;
                let queue = Arc::new(AsyncQueue::new());
                queue.enqueue(Ok(event));
                queue.finish();
                Ok(AgentStream::new(queue))
            })
        }
    }

    fn console_orchestrator() -> Arc<TaskOrchestrator> {
        let config = BridgeSection::default();
        Arc::new(TaskOrchestrator::new(
            Arc::new(SessionManager::from_config(&config)),
            Arc::new(TaskRegistry::new()),
            Arc::new(DoneBackend),
            Arc::new(ConsoleTransport::default()),
            Arc::new(CardRenderer),
            config,
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cd_applies_before_the_next_task() {
        let dir = tempfile::tempdir().unwrap();
        for round in 0..50 {
            let orchestrator = console_orchestrator();
            let mut tasks = JoinSet::new();
            let cd = format!("/cd {}", dir.path().display());
            dispatch(&orchestrator, &mut tasks, InboundMessage::new("console", "msg-1", cd)).await;
            dispatch(
                &orchestrator,
                &mut tasks,
                InboundMessage::new("console", "msg-2", "fix it"),
            )
            .await;

            let outcome = tasks.join_next().await.unwrap().unwrap();
            assert!(
                matches!(outcome, MessageOutcome::Finished(_)),
                "round {round}: {outcome:?}"
            );
            assert!(tasks.is_empty());
        }
    }

    #[test]
    fn plain_line_has_no_attachment() {
        assert_eq!(split_attachment("  fix it "), (None, "fix it".to_string()));
    }

    #[test]
    fn leading_at_path_is_attachment() {
        assert_eq!(
            split_attachment("@/tmp/shot.png what is wrong here?"),
            (Some("/tmp/shot.png".into()), "what is wrong here?".into())
        );
        assert_eq!(
            split_attachment("@/tmp/shot.png"),
            (Some("/tmp/shot.png".into()), String::new())
        );
    }

    #[tokio::test]
    async fn upload_key_is_path() {
        let transport = ConsoleTransport::default();
        let key = transport
            .upload_artifact(Path::new("/tmp/out.png"))
            .await
            .unwrap();
        assert_eq!(key, "/tmp/out.png");
    }

    #[tokio::test]
    async fn card_ids_are_sequential() {
        let transport = ConsoleTransport::default();
        let a = transport.send_render("console", "{}").await.unwrap();
        let b = transport.send_render("console", "{}").await.unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("card-1", "card-2"));
    }
}
