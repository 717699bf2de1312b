//! In-memory fakes of the authenticator, transport and handler seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use telemetra_core::Message;
use tokio::sync::{mpsc, Notify};

use crate::auth::{AuthError, Authenticator, Credentials};
use crate::session::{InboundHandler, Session};
use crate::transport::{Connection, Connector, TransportError};

pub const WAIT: Duration = Duration::from_secs(2);

/// The server's side of one fake connection.
pub struct ServerEnd {
    pub from_client: mpsc::Receiver<String>,
    pub to_client: mpsc::Sender<String>,
}

impl ServerEnd {
    pub async fn recv(&mut self) -> Message {
        let text = tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("frame in time")
            .expect("link open");
        Message::from_json(&text).expect("decodable frame")
    }

    pub async fn send(&self, message: Message) {
        self.send_text(message.to_json()).await;
    }

    pub async fn send_text(&self, text: String) {
        self.to_client.send(text).await.expect("client listening");
    }
}

pub struct FakeConnector {
    ends: mpsc::UnboundedSender<ServerEnd>,
    pub deny: AtomicUsize,
    /// Connect attempts never complete while set.
    pub stall: AtomicBool,
    pub connects: AtomicUsize,
    pub cookies: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (ends, rx) = mpsc::unbounded_channel();
        let connector = FakeConnector {
            ends,
            deny: AtomicUsize::new(0),
            stall: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            cookies: Mutex::new(Vec::new()),
        };
        (Arc::new(connector), rx)
    }
}

impl Connector for FakeConnector {
    fn connect<'a>(&'a self, cookie: &'a str) -> BoxFuture<'a, Result<Connection, TransportError>> {
        async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.cookies.lock().push(cookie.to_string());
            if self.stall.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            let denied = self
                .deny
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if denied {
                return Err(TransportError::Denied);
            }
            let (out_tx, out_rx) = mpsc::channel(64);
            let (in_tx, in_rx) = mpsc::channel(64);
            let _ = self.ends.send(ServerEnd {
                from_client: out_rx,
                to_client: in_tx,
            });
            Ok(Connection {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
        .boxed()
    }
}

#[derive(Default)]
pub struct FakeAuthenticator {
    pub logins: AtomicUsize,
    pub fail: AtomicBool,
    /// Logins never complete while set.
    pub stall: AtomicBool,
}

impl Authenticator for FakeAuthenticator {
    fn login(&self) -> BoxFuture<'_, Result<Credentials, AuthError>> {
        async move {
            if self.stall.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(AuthError::AccessDenied);
            }
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Credentials {
                cookie: format!("sid={n}"),
            })
        }
        .boxed()
    }
}

#[derive(Default)]
pub struct RecordingHandler {
    pub messages: Mutex<Vec<Message>>,
    pub disconnects: AtomicUsize,
    pub reconnects: AtomicUsize,
    pub closed: AtomicBool,
    /// Resync waits for `release` while set.
    pub hold_reconnect: AtomicBool,
    pub release: Notify,
}

impl InboundHandler for RecordingHandler {
    fn process(&self, message: Message) -> BoxFuture<'_, ()> {
        self.messages.lock().push(message);
        async {}.boxed()
    }

    fn on_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reconnect<'a>(&'a self, _session: &'a Session) -> BoxFuture<'a, ()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        async move {
            if self.hold_reconnect.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
        }
        .boxed()
    }

    fn on_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Polls `check` until it holds or the wait runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub async fn next_end(ends: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(WAIT, ends.recv())
        .await
        .expect("connection in time")
        .expect("connector alive")
}
