//! WebSocket relay client
//!
//! Connects to the relay, splits the socket into a sender task and a
//! receiver task, and exposes inbound messages as a channel. Clock-probe
//! replies are matched to their pending probe and never reach the inbound
//! channel.

use super::protocol::{ClientMessage, ServerMessage};
use super::{PeerSignal, RelayOutbound, SignalingChannel};
use crate::sync::TimeSource;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Probes awaiting a reply, keyed by the bits of their client time
type PendingProbes = Mutex<HashMap<u64, oneshot::Sender<f64>>>;

/// Cloneable handle for queuing messages to the relay
#[derive(Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<Message>,
}

impl RelayOutbound for RelaySender {
    fn send_message(&self, message: ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        self.tx
            .send(Message::Text(text))
            .map_err(|_| Error::SignalingError("relay connection closed".to_string()))
    }
}

#[async_trait]
impl SignalingChannel for RelaySender {
    async fn send(&self, to: &str, signal: PeerSignal) -> Result<()> {
        debug!("Sending {} to {}", signal.kind(), to);
        self.send_message(signal.into_client_message(to))
    }
}

/// Connection to a relay server
pub struct RelayClient {
    url: String,
    sender: RelaySender,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
    probes: Arc<PendingProbes>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayClient {
    /// Connect and start the socket tasks
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to relay: {}", url);
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| Error::SignalingError(format!("Failed to connect to {}: {}", url, e)))?;
        let (write, read) = ws.split();

        let (tx, rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let probes: Arc<PendingProbes> = Arc::new(Mutex::new(HashMap::new()));

        let tasks = vec![
            tokio::spawn(Self::sender_task(write, rx)),
            tokio::spawn(Self::receiver_task(read, inbound_tx, Arc::clone(&probes))),
        ];

        Ok(Self {
            url: url.to_string(),
            sender: RelaySender { tx },
            inbound: Mutex::new(Some(inbound_rx)),
            probes,
            tasks,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Handle for sending from other tasks
    pub fn sender(&self) -> RelaySender {
        self.sender.clone()
    }

    /// Take the inbound message stream; only the first call gets it
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.inbound.lock().take()
    }

    /// Ask to join a room
    pub fn join(&self, room: &str, user: &str) -> Result<()> {
        self.sender.send_message(ClientMessage::Join {
            room: room.to_string(),
            user: user.to_string(),
        })
    }

    /// Close the socket
    pub fn close(&self) {
        let _ = self.sender.tx.send(Message::Close(None));
    }

    async fn sender_task(
        mut write: SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send relay message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        debug!("Relay sender task terminated");
    }

    async fn receiver_task(
        mut read: SplitStream<WsStream>,
        inbound: mpsc::UnboundedSender<ServerMessage>,
        probes: Arc<PendingProbes>,
    ) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                    Ok(ServerMessage::TimeSyncResponse {
                        server_time,
                        client_time,
                    }) => {
                        if let Some(waiter) = probes.lock().remove(&client_time.to_bits()) {
                            let _ = waiter.send(server_time);
                        } else {
                            debug!("Late clock probe reply for {}", client_time);
                        }
                    }
                    Ok(message) => {
                        if inbound.send(message).is_err() {
                            debug!("Inbound relay channel dropped");
                        }
                    }
                    Err(e) => warn!("Unparseable relay message: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("Relay closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Relay connection error: {}", e);
                    break;
                }
            }
        }
        // Fail outstanding probes immediately
        probes.lock().clear();
        debug!("Relay receiver task terminated");
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Removes a pending probe when its waiter goes away
struct ProbeGuard<'a> {
    probes: &'a PendingProbes,
    key: u64,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.probes.lock().remove(&self.key);
    }
}

#[async_trait]
impl TimeSource for RelayClient {
    async fn probe(&self, client_time: f64) -> Result<f64> {
        let key = client_time.to_bits();
        let (tx, rx) = oneshot::channel();
        self.probes.lock().insert(key, tx);
        let _guard = ProbeGuard {
            probes: &self.probes,
            key,
        };

        self.sender
            .send_message(ClientMessage::TimeSyncRequest { client_time })?;
        rx.await
            .map_err(|_| Error::SignalingError("relay closed before probe reply".to_string()))
    }
}
