//! The agent socket: a tungstenite connection bridged onto channels.
//!
//! The session loop never touches the websocket directly. A reader task turns
//! socket frames into [`Inbound`] events and a writer task drains
//! [`Outbound`] frames queued by [`ChannelTransport`].

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::Message as WsMessage,
    },
};
use tracing::{debug, info, warn};
use voice_agent_core::{Transport, TransportError};

/// An event read from the agent socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Binary(Bytes),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// A frame queued for the agent socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    Close,
}

/// A connected socket, split into its outbound and inbound halves.
pub struct SocketLink {
    pub transport: Box<dyn Transport>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens agent sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, token: &SecretString) -> Result<SocketLink, TransportError>;
}

/// [`Transport`] that queues frames for a writer task.
pub struct ChannelTransport {
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

impl ChannelTransport {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            outbound: Some(outbound),
        }
    }

    fn queue(&self, frame: Outbound) -> Result<(), TransportError> {
        self.outbound
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }
}

impl Transport for ChannelTransport {
    fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.queue(Outbound::Text(text))
    }

    fn send_binary(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.queue(Outbound::Binary(frame))
    }

    fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Outbound::Close);
        }
    }
}

/// How long the peer gets to answer our close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects with tokio-tungstenite, authenticating via the `token` subprotocol.
#[derive(Debug, Clone)]
pub struct WsConnector {
    close_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            close_timeout: CLOSE_TIMEOUT,
        }
    }
}

impl WsConnector {
    pub fn with_close_timeout(close_timeout: Duration) -> Self {
        Self { close_timeout }
    }
}

/// Value of the `Sec-WebSocket-Protocol` header carrying the access token.
pub(crate) fn auth_protocol(token: &SecretString) -> String {
    format!("token, {}", token.expose_secret())
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, token: &SecretString) -> Result<SocketLink, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let protocol = HeaderValue::from_str(&auth_protocol(token))
            .map_err(|_| TransportError::Connect("token is not a valid header value".into()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", protocol);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        info!(url, "Connected to agent socket.");

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

        let writer_errors = in_tx.clone();
        let mut reader = tokio::spawn(async move {
            while let Some(msg_result) = ws_rx.next().await {
                let event = match msg_result {
                    Ok(WsMessage::Text(text)) => Inbound::Text(text.as_str().to_string()),
                    Ok(WsMessage::Binary(data)) => Inbound::Binary(data),
                    Ok(WsMessage::Close(frame)) => Inbound::Closed {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame
                            .map(|f| f.reason.as_str().to_string())
                            .unwrap_or_default(),
                    },
                    Ok(_) => continue,
                    Err(e) => Inbound::Error(e.to_string()),
                };
                let finished = matches!(event, Inbound::Closed { .. } | Inbound::Error(_));
                if in_tx.send(event).is_err() || finished {
                    return;
                }
            }
            let _ = in_tx.send(Inbound::Closed {
                code: None,
                reason: String::new(),
            });
        });

        let close_timeout = self.close_timeout;
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let result = match frame {
                    Outbound::Text(text) => ws_tx.send(WsMessage::Text(text.into())).await,
                    Outbound::Binary(data) => ws_tx.send(WsMessage::Binary(data)).await,
                    Outbound::Close => break,
                };
                if let Err(e) = result {
                    warn!(error = %e, "Failed to write to agent socket");
                    let _ = writer_errors.send(Inbound::Error(e.to_string()));
                    break;
                }
            }
            // The peer gets a bounded window to answer the close frame; after
            // that the reader is aborted and the socket dropped.
            if timeout(close_timeout, ws_tx.close()).await.is_err() {
                debug!("Agent socket close handshake timed out");
            }
            let _ = timeout(close_timeout, &mut reader).await;
            reader.abort();
            debug!("Agent socket closed by client.");
        });

        Ok(SocketLink {
            transport: Box::new(ChannelTransport::new(out_tx)),
            inbound: in_rx,
        })
    }
}
