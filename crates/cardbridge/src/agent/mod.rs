pub mod cli;
pub mod events;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::queue::AsyncQueue;

use self::events::AgentEvent;

/// Everything the backend needs to start one agent run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub workspace: PathBuf,
    /// Continue a previous backend session instead of starting fresh.
    pub resume: Option<String>,
    /// Fired on `/stop` or timeout. Backends should abort their transport.
    pub cancel: CancellationToken,
}

/// Pull side of a running agent: yields events until the run ends.
///
/// Backends push into the shared queue from whatever task reads the
/// transport and call `finish` when the run is over.
pub struct AgentStream {
    queue: Arc<AsyncQueue<Result<AgentEvent, Error>>>,
}

impl AgentStream {
    pub fn new(queue: Arc<AsyncQueue<Result<AgentEvent, Error>>>) -> Self {
        Self { queue }
    }

    pub async fn next(&mut self) -> Option<Result<AgentEvent, Error>> {
        self.queue.next().await
    }
}

/// An agent backend that turns a request into an event stream.
///
/// Uses `Pin<Box<dyn Future>>` so the trait stays object safe.
pub trait AgentBackend: Send + Sync {
    fn open(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentStream, Error>> + Send + '_>>;
}
