pub mod agent;
pub mod channel;
pub mod config;
pub mod error;
pub mod queue;
pub mod stream;
mod util;

pub use agent::cli::ClaudeCliBackend;
pub use agent::events::AgentEvent;
pub use agent::{AgentBackend, AgentRequest, AgentStream};
pub use channel::{
    AdmissionRejection, CardRenderer, InboundMessage, MessageOutcome, MessagingTransport,
    RateLimiter, Renderer, SessionManager, TaskOrchestrator, TaskRegistry, TransportFuture,
};
pub use config::{AgentConfig, BridgeConfig, BridgeSection};
pub use error::Error;
pub use queue::AsyncQueue;
pub use stream::{Snapshot, StreamProcessor, TaskStatus};
