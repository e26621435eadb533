//! The message bridge: per-conversation contexts, task admission, throttled
//! card updates and the transport seam to the chat platform.

pub mod artifacts;
pub mod card;
pub mod commands;
pub mod limiter;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod transport;

pub use card::{CardRenderer, Renderer};
pub use commands::Command;
pub use limiter::RateLimiter;
pub use orchestrator::{AdmissionRejection, InboundMessage, MessageOutcome, TaskOrchestrator};
pub use registry::{TaskRegistry, TaskTicket};
pub use session::{ContextInfo, SessionManager};
pub use transport::{MessagingTransport, TransportFuture};
