//! Replies awaited by outbound requests, keyed by request sequence.

use std::collections::HashMap;

use parking_lot::Mutex;
use telemetra_core::{Message, TimeUuid};
use tokio::sync::{mpsc, oneshot};

enum Waiter {
    /// Resolved by the first reply, then removed.
    Single(oneshot::Sender<Message>),
    /// Receives every reply until the requester deregisters.
    Stream(mpsc::UnboundedSender<Message>),
}

/// What happened to an inbound message offered to the table.
#[derive(Debug)]
pub enum Delivery {
    Resolved,
    Unmatched(Message),
}

#[derive(Default)]
pub struct PendingTable {
    waiters: Mutex<HashMap<TimeUuid, Waiter>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, seq: TimeUuid) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(seq, Waiter::Single(tx));
        rx
    }

    pub fn register_stream(&self, seq: TimeUuid) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.waiters.lock().insert(seq, Waiter::Stream(tx));
        rx
    }

    pub fn remove(&self, seq: &TimeUuid) {
        self.waiters.lock().remove(seq);
    }

    pub fn contains(&self, seq: &TimeUuid) -> bool {
        self.waiters.lock().contains_key(seq)
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Hands `message` to whoever awaits its in-reply-to sequence. Replies
    /// nobody is waiting for anymore come back as unmatched.
    pub fn deliver(&self, message: Message) -> Delivery {
        let Some(irt) = message.in_reply_to() else {
            return Delivery::Unmatched(message);
        };
        let mut waiters = self.waiters.lock();
        match waiters.remove(&irt) {
            None => Delivery::Unmatched(message),
            Some(Waiter::Single(tx)) => match tx.send(message) {
                Ok(()) => Delivery::Resolved,
                Err(message) => Delivery::Unmatched(message),
            },
            Some(Waiter::Stream(tx)) => match tx.send(message) {
                Ok(()) => {
                    waiters.insert(irt, Waiter::Stream(tx));
                    Delivery::Resolved
                }
                Err(err) => Delivery::Unmatched(err.0),
            },
        }
    }

    /// Drops every waiter so their receivers resolve empty.
    pub fn fail_all(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let count = waiters.len();
        waiters.clear();
        count
    }
}
