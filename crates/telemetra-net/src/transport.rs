//! Framed text transport to the server.

use futures::future::BoxFuture;
use futures::FutureExt;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, warn};
use url::Url;

const CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server denied the connection")]
    Denied,
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
}

/// An open link. Dropping `outbound` closes it; `inbound` yields `None` once
/// the peer is gone.
pub struct Connection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

pub trait Connector: Send + Sync {
    /// Opens a link authorised by the session `cookie`.
    fn connect<'a>(&'a self, cookie: &'a str) -> BoxFuture<'a, Result<Connection, TransportError>>;
}

/// WebSocket link carrying one JSON message per text frame.
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        WsConnector { url }
    }

    async fn open(&self, cookie: &str) -> Result<Connection, TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            url: self.url.to_string(),
            reason,
        };
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| connect_error(err.to_string()))?;
        let cookie = HeaderValue::from_str(cookie).map_err(|err| connect_error(err.to_string()))?;
        request.headers_mut().insert(COOKIE, cookie);

        let (ws_stream, _) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(WsError::Http(response))
                if matches!(response.status(), StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) =>
            {
                return Err(TransportError::Denied);
            }
            Err(err) => return Err(connect_error(err.to_string())),
        };
        debug!(url = %self.url, "transport.connected");

        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_DEPTH);
        let (pong_tx, mut pong_rx) = mpsc::channel::<Vec<u8>>(4);

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    text = out_rx.recv() => match text {
                        Some(text) => WsMessage::Text(text),
                        None => break,
                    },
                    Some(payload) = pong_rx.recv() => WsMessage::Pong(payload),
                };
                if let Err(err) = sink.send(frame).await {
                    warn!(error = %err, "transport.send_failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Ping(payload)) => {
                        let _ = pong_tx.send(payload).await;
                    }
                    Ok(WsMessage::Close(frame)) => {
                        debug!(frame = ?frame, "transport.closed_by_peer");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "transport.recv_error");
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl Connector for WsConnector {
    fn connect<'a>(&'a self, cookie: &'a str) -> BoxFuture<'a, Result<Connection, TransportError>> {
        self.open(cookie).boxed()
    }
}
