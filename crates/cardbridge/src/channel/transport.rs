use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::error::Error;

/// Boxed future returned by transport methods, keeping the trait object safe.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// Outbound side of the chat platform.
///
/// Every call is best effort: callers log failures and carry on.
pub trait MessagingTransport: Send + Sync {
    /// Post a new card. Returns the platform message id for later updates.
    fn send_render<'a>(&'a self, context_id: &'a str, content: &'a str)
    -> TransportFuture<'a, String>;

    /// Replace the content of a previously sent card.
    fn update_render<'a>(&'a self, message_id: &'a str, content: &'a str)
    -> TransportFuture<'a, ()>;

    /// Send a plain text reply (command responses, rejections).
    fn send_text<'a>(&'a self, context_id: &'a str, text: &'a str) -> TransportFuture<'a, ()>;

    /// Fetch an attachment from an inbound message into `dest`.
    fn download_input_artifact<'a>(
        &'a self,
        message_id: &'a str,
        artifact_key: &'a str,
        dest: &'a Path,
    ) -> TransportFuture<'a, ()>;

    /// Upload a local file. Returns the key used to reference it in a message.
    fn upload_artifact<'a>(&'a self, path: &'a Path) -> TransportFuture<'a, String>;

    /// Post an uploaded artifact into the conversation.
    fn send_artifact_message<'a>(
        &'a self,
        context_id: &'a str,
        artifact_key: &'a str,
    ) -> TransportFuture<'a, ()>;
}
