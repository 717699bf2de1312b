//! The seam between producers of messages (scheduler, store bookkeeping) and
//! whatever carries them to the server.

use std::time::Duration;

use futures::future::BoxFuture;

use crate::message::Message;

/// How a message should be handled when it cannot be sent right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Queue the message while disconnected instead of dropping it.
    pub defer: bool,
    /// How long to wait for the reply once the message is on the wire.
    pub timeout: Option<Duration>,
    /// How long a deferred message may wait for the link to come back.
    pub defer_timeout: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            defer: true,
            timeout: None,
            defer_timeout: None,
        }
    }
}

impl SendOptions {
    pub fn no_defer() -> Self {
        SendOptions {
            defer: false,
            ..SendOptions::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_defer_timeout(mut self, timeout: Duration) -> Self {
        self.defer_timeout = Some(timeout);
        self
    }
}

/// Outbound message channel. Resolves to the reply, or `None` when the
/// message was dropped, timed out or the link closed.
pub trait Uplink: Send + Sync {
    fn send_message(&self, message: Message, options: SendOptions) -> BoxFuture<'_, Option<Message>>;
}
