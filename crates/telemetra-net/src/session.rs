//! Connection lifecycle and request/response correlation.
//!
//! ```text
//! Unauthenticated -> Authenticating -> Connecting -> Connected
//!                                          ^             |
//!                                          +- Disconnected <-+
//! any state -> Closed
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use telemetra_core::message::RequestData;
use telemetra_core::{Message, Payload, SendOptions, TimeUuid, Uplink};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, Authenticator, Credentials};
use crate::pending::{Delivery, PendingTable};
use crate::transport::{Connection, Connector, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub reconnect_delay: Duration,
    pub workers: usize,
    /// Upper bound for a multi-part data request.
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(15),
            workers: 5,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("session is closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
}

/// Receives inbound messages nobody awaits and link lifecycle events.
pub trait InboundHandler: Send + Sync {
    fn process(&self, message: Message) -> BoxFuture<'_, ()>;

    fn on_disconnect(&self) {}

    /// Runs after a reconnect, before deferred messages are flushed.
    fn on_reconnect<'a>(&'a self, _session: &'a Session) -> BoxFuture<'a, ()> {
        async {}.boxed()
    }

    fn on_close(&self) {}
}

/// Where an outgoing frame goes.
enum Route {
    Send,
    Queued,
    Drop,
}

enum WorkItem {
    Message(Message),
    Stop,
}

pub struct Session {
    config: SessionConfig,
    authenticator: Arc<dyn Authenticator>,
    connector: Arc<dyn Connector>,
    state: watch::Sender<SessionState>,
    shutdown: watch::Sender<bool>,
    pending: PendingTable,
    handler: RwLock<Option<Arc<dyn InboundHandler>>>,
    link: Mutex<Option<mpsc::Sender<String>>>,
    deferred: Mutex<VecDeque<(TimeUuid, String)>>,
    login_started: AtomicBool,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        authenticator: Arc<dyn Authenticator>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Unauthenticated);
        let (shutdown, _) = watch::channel(false);
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        Arc::new(Session {
            config,
            authenticator,
            connector,
            state,
            shutdown,
            pending: PendingTable::new(),
            handler: RwLock::new(None),
            link: Mutex::new(None),
            deferred: Mutex::new(VecDeque::new()),
            login_started: AtomicBool::new(false),
            work_tx,
            work_rx: Arc::new(tokio::sync::Mutex::new(work_rx)),
            workers: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
        })
    }

    pub fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.handler.read().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == SessionState::Closed {
                return false;
            }
            debug!(from = ?*current, to = ?next, "session.state");
            *current = next;
            true
        });
    }

    /// Resolves once the session reaches `wanted` (or closes).
    pub async fn wait_for(&self, wanted: SessionState) -> SessionState {
        let mut rx = self.state.subscribe();
        let reached = rx
            .wait_for(|state| *state == wanted || *state == SessionState::Closed)
            .await
            .map(|state| *state);
        reached.unwrap_or(SessionState::Closed)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Authenticates and starts the connection supervisor. Calling it again
    /// once a login has started does nothing.
    pub async fn login(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if self.login_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_state(SessionState::Authenticating);
        let credentials = match self.authenticator.login().await {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(error = %err, "session.login_failed");
                self.login_started.store(false, Ordering::SeqCst);
                self.set_state(SessionState::Unauthenticated);
                return Err(err.into());
            }
        };
        self.start_workers();
        self.set_state(SessionState::Connecting);
        let handle = tokio::spawn(self.clone().supervise(credentials));
        *self.supervisor.lock() = Some(handle);
        Ok(())
    }

    fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        for worker in 0..self.config.workers.max(1) {
            let session = self.clone();
            let queue = self.work_rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let item = queue.lock().await.recv().await;
                    match item {
                        Some(WorkItem::Message(message)) => match session.handler() {
                            Some(handler) => handler.process(message).await,
                            None => debug!(action = %message.action(), "session.unhandled"),
                        },
                        Some(WorkItem::Stop) | None => break,
                    }
                }
                debug!(worker, "session.worker_stopped");
            }));
        }
    }

    /// Correlates replies in arrival order; everything else goes to the
    /// worker pool.
    fn dispatch(&self, text: &str) {
        let message = match Message::from_json(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "session.decode_failed");
                return;
            }
        };
        if let Delivery::Unmatched(message) = self.pending.deliver(message) {
            let _ = self.work_tx.send(WorkItem::Message(message));
        }
    }

    async fn supervise(self: Arc<Self>, mut credentials: Credentials) {
        let mut shutdown = self.shutdown.subscribe();
        let mut reconnecting = false;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(SessionState::Connecting);
            let Some(connected) =
                unless_shutdown(&mut shutdown, self.connector.connect(&credentials.cookie)).await
            else {
                break;
            };
            match connected {
                Ok(connection) => {
                    info!(reconnect = reconnecting, "session.connected");
                    self.run_connection(connection, reconnecting, &mut shutdown)
                        .await;
                    *self.link.lock() = None;
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!("session.disconnected");
                    self.set_state(SessionState::Disconnected);
                    if let Some(handler) = self.handler() {
                        handler.on_disconnect();
                    }
                    reconnecting = true;
                }
                Err(TransportError::Denied) => {
                    warn!("session.access_denied");
                    self.set_state(SessionState::Authenticating);
                    match unless_shutdown(&mut shutdown, self.authenticator.login()).await {
                        Some(Ok(fresh)) => {
                            credentials = fresh;
                            continue;
                        }
                        Some(Err(err)) => warn!(error = %err, "session.reauth_failed"),
                        None => break,
                    }
                    self.set_state(SessionState::Disconnected);
                }
                Err(err) => {
                    warn!(error = %err, "session.connect_failed");
                    self.set_state(SessionState::Disconnected);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        debug!("session.supervisor_stopped");
    }

    /// Pumps inbound frames until the link drops or shutdown is requested.
    /// Resync and the deferred flush run alongside; the flush switches the
    /// session to connected once the queue is drained.
    async fn run_connection(
        &self,
        connection: Connection,
        reconnecting: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let Connection {
            outbound,
            mut inbound,
        } = connection;
        *self.link.lock() = Some(outbound);

        let resume = async {
            if reconnecting {
                if let Some(handler) = self.handler() {
                    handler.on_reconnect(self).await;
                }
            }
            self.flush_deferred().await;
        };
        tokio::pin!(resume);
        let mut resumed = false;
        loop {
            tokio::select! {
                _ = &mut resume, if !resumed => resumed = true,
                frame = inbound.recv() => match frame {
                    Some(text) => self.dispatch(&text),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Returns false if the link dropped before the queue drained.
    async fn flush_deferred(&self) -> bool {
        loop {
            let next = {
                let mut deferred = self.deferred.lock();
                let next = deferred.pop_front();
                if next.is_none() {
                    // senders route under this lock
                    self.set_state(SessionState::Connected);
                }
                next
            };
            let Some((seq, text)) = next else {
                return true;
            };
            if !self.transmit(text.clone()).await {
                self.deferred.lock().push_front((seq, text));
                return false;
            }
            debug!(%seq, "session.deferred_flushed");
        }
    }

    /// Decides under the deferred lock whether a frame goes out now or waits
    /// for the next flush.
    fn route(&self, seq: TimeUuid, text: &str, defer: bool) -> Route {
        let mut deferred = self.deferred.lock();
        if *self.shutdown.borrow() {
            return Route::Drop;
        }
        match self.state() {
            SessionState::Closed => Route::Drop,
            SessionState::Connected if self.link.lock().is_some() => Route::Send,
            _ if defer => {
                deferred.push_back((seq, text.to_string()));
                Route::Queued
            }
            _ => Route::Drop,
        }
    }

    /// Writes a frame on the current link, if there is one.
    async fn transmit(&self, text: String) -> bool {
        let Some(link) = self.link.lock().clone() else {
            return false;
        };
        if link.send(text).await.is_ok() {
            return true;
        }
        let mut current = self.link.lock();
        if current.as_ref().is_some_and(|live| live.same_channel(&link)) {
            *current = None;
        }
        false
    }

    async fn await_reply(
        &self,
        seq: TimeUuid,
        rx: oneshot::Receiver<Message>,
        timeout: Option<Duration>,
    ) -> Option<Message> {
        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply.ok(),
                Err(_) => {
                    debug!(%seq, "session.reply_timeout");
                    None
                }
            },
            None => rx.await.ok(),
        };
        if reply.is_none() {
            self.pending.remove(&seq);
            self.deferred.lock().retain(|(queued, _)| *queued != seq);
        }
        reply
    }

    /// Sends `message` and waits for its reply.
    ///
    /// The reply slot is registered before the frame is written. When the
    /// link is down the message is either queued for the next connection
    /// (`defer`) or dropped, in which case `None` is returned at once.
    /// Queued frames go out ahead of any frame sent after the next
    /// reconnect.
    pub async fn send_message(&self, message: Message, options: SendOptions) -> Option<Message> {
        if self.state() == SessionState::Closed {
            return None;
        }
        let seq = message.sequence();
        let rx = self.pending.register(seq);
        let text = message.to_json();
        loop {
            match self.route(seq, &text, options.defer) {
                Route::Send => {
                    if self.transmit(text.clone()).await {
                        return self.await_reply(seq, rx, options.timeout).await;
                    }
                    // the link is gone; route again
                }
                Route::Queued => {
                    debug!(%seq, action = %message.action(), "session.deferred");
                    return self.await_reply(seq, rx, options.defer_timeout).await;
                }
                Route::Drop => break,
            }
        }
        self.pending.remove(&seq);
        None
    }

    /// Sends on the current link regardless of resync, without deferral.
    pub async fn send_immediate(&self, message: Message, timeout: Duration) -> Option<Message> {
        let seq = message.sequence();
        let rx = self.pending.register(seq);
        if !self.transmit(message.to_json()).await {
            self.pending.remove(&seq);
            return None;
        }
        self.await_reply(seq, rx, Some(timeout)).await
    }

    /// Requests stored history. The server answers with any number of data
    /// intervals followed by a generic response; all replies are returned in
    /// arrival order.
    pub async fn request_data(&self, request: RequestData) -> Result<Vec<Message>, SessionError> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let message = Message::new(request);
        let seq = message.sequence();
        let mut rx = self.pending.register_stream(seq);
        if !self.transmit(message.to_json()).await {
            self.pending.remove(&seq);
            return Err(SessionError::NotConnected);
        }
        let collect = async {
            let mut replies = Vec::new();
            while let Some(reply) = rx.recv().await {
                let done = matches!(reply.payload(), Payload::GenericResponse(_));
                replies.push(reply);
                if done {
                    return Ok(replies);
                }
            }
            Err(SessionError::Closed)
        };
        let outcome = tokio::time::timeout(self.config.request_timeout, collect)
            .await
            .unwrap_or(Err(SessionError::Timeout));
        self.pending.remove(&seq);
        outcome
    }

    /// Stops the supervisor and drains the workers, then fails whatever is
    /// still awaiting a reply.
    pub async fn close(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        info!("session.closing");
        self.shutdown.send_replace(true);
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        *self.link.lock() = None;

        let workers = std::mem::take(&mut *self.workers.lock());
        for _ in &workers {
            let _ = self.work_tx.send(WorkItem::Stop);
        }
        for handle in workers {
            let _ = handle.await;
        }

        let failed = self.pending.fail_all();
        self.deferred.lock().clear();
        if let Some(handler) = self.handler.write().take() {
            handler.on_close();
        }
        self.set_state(SessionState::Closed);
        info!(failed, "session.closed");
    }

    /// Resolves when the session is closed.
    pub async fn join(&self) {
        self.wait_for(SessionState::Closed).await;
    }
}

/// Runs `work` unless shutdown is requested first.
async fn unless_shutdown<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    work: F,
) -> Option<F::Output> {
    if *shutdown.borrow() {
        return None;
    }
    tokio::select! {
        output = work => Some(output),
        _ = shutdown.changed() => None,
    }
}

impl Uplink for Session {
    fn send_message(&self, message: Message, options: SendOptions) -> BoxFuture<'_, Option<Message>> {
        Session::send_message(self, message, options).boxed()
    }
}
