//! WebSocket transport to the remote agent.
//!
//! A [`Connector`] opens a [`Connection`]: a pair of channels in front of a
//! spawned pump task that owns the socket. The call controller never touches
//! the socket directly. It sends [`Outbound`] commands and receives
//! [`Inbound`] units in the order the socket produced them, starting with
//! [`Inbound::Opened`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::{CloseFrame, Message as WsMessage, frame::coding::CloseCode},
};
use tracing::{debug, error, info, warn};
use voice_call_core::{
    error::CallError,
    protocol::{ClientMessage, Inbound, InboundFrame},
};

/// Queue depth in each direction between the controller and the pump task.
const CHANNEL_CAPACITY: usize = 256;

/// A command for the pump task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ClientMessage),
    /// Close the socket with a normal close code and stop the pump.
    Close,
}

/// Opens connections to the agent.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connection, CallError>;
}

/// The controller's end of one open connection.
///
/// A connector hands this out only after the handshake has completed, so
/// holding one means the socket is open.
pub struct Connection {
    outbound: mpsc::Sender<Outbound>,
    inbound: mpsc::Receiver<Inbound>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(
        outbound: mpsc::Sender<Outbound>,
        inbound: mpsc::Receiver<Inbound>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            task,
        }
    }

    /// Waits for the next inbound unit. `None` once the pump has gone away.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    /// Queues a message for the agent without waiting.
    ///
    /// A full queue drops the message; a vanished pump is a transport error.
    pub fn send(&self, message: ClientMessage) -> Result<(), CallError> {
        match self.outbound.try_send(Outbound::Message(message)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue is full, dropping message");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(CallError::Transport("connection task has stopped".into()))
            }
        }
    }

    /// Closes the socket. Anything the pump reports afterwards is discarded.
    pub fn close(self) {
        if self.outbound.try_send(Outbound::Close).is_err() {
            if let Some(task) = &self.task {
                debug!("Close could not be queued, aborting connection task");
                task.abort();
            }
        }
    }
}

/// Connects over `ws://` or `wss://` with tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, CallError> {
        info!(%url, "Connecting to agent");
        let (ws_stream, _) = connect_async(url).await.map_err(|e| {
            error!(error = %e, "Failed to connect to agent WebSocket");
            CallError::Transport(e.to_string())
        })?;
        info!("Connected to agent");

        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        // The handshake has completed; nothing can be delivered ahead of this.
        inbound_tx
            .try_send(Inbound::Opened)
            .map_err(|e| CallError::Transport(e.to_string()))?;
        let task = tokio::spawn(pump(ws_stream, outbound_rx, inbound_tx));
        Ok(Connection::new(outbound_tx, inbound_rx, Some(task)))
    }
}

/// Moves messages between the socket and the controller's channels until
/// either side closes.
async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<Inbound>,
) {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Message(message)) => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            error!(error = %e, "Failed to serialize outbound message");
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(WsMessage::Text(json.into())).await {
                        warn!(error = %e, "Failed to send to agent");
                        let _ = inbound.send(Inbound::TransportError(e.to_string())).await;
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "call ended".into(),
                    };
                    let _ = ws_tx.send(WsMessage::Close(Some(frame))).await;
                    let _ = ws_tx.close().await;
                    debug!("Connection closed by client");
                    break;
                }
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let unit = Inbound::Frame(InboundFrame::Text(text.to_string()));
                    if inbound.send(unit).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    let unit = Inbound::Frame(InboundFrame::Binary(data.to_vec()));
                    if inbound.send(unit).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    let _ = inbound.send(Inbound::Closed { code, reason }).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = inbound.send(Inbound::TransportError(e.to_string())).await;
                    break;
                }
                None => {
                    let _ = inbound
                        .send(Inbound::Closed {
                            code: None,
                            reason: String::new(),
                        })
                        .await;
                    break;
                }
            },
        }
    }
}
