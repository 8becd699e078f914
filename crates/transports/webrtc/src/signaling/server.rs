//! WebSocket relay server
//!
//! Accepts WebSocket connections, expects a `join` as the first message and
//! then feeds every text frame through the [`RoomRegistry`]. Rejections are
//! reported to the sender as `error` messages; the connection stays open.

use super::protocol::{ClientMessage, ServerMessage};
use super::relay::{RoomRegistry, DEFAULT_MAX_ROOM_SIZE};
use crate::clock::{SharedClock, SystemClock};
use crate::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Relay server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,

    /// Participants allowed per room
    pub max_room_size: usize,

    /// Largest accepted text frame in bytes
    pub max_message_bytes: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_room_size: DEFAULT_MAX_ROOM_SIZE,
            max_message_bytes: 64 * 1024,
        }
    }
}

impl RelayServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_room_size == 0 {
            return Err(Error::InvalidConfig(
                "max_room_size must be at least 1".to_string(),
            ));
        }
        if self.max_message_bytes < 1024 {
            return Err(Error::InvalidConfig(
                "max_message_bytes must be at least 1024".to_string(),
            ));
        }
        Ok(())
    }
}

/// WebSocket front end for a [`RoomRegistry`]
pub struct RelayServer {
    config: RelayServerConfig,
    registry: Arc<RoomRegistry>,
}

impl RelayServer {
    /// Server stamping with the system clock
    pub fn new(config: RelayServerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RelayServerConfig, clock: SharedClock) -> Self {
        let registry =
            Arc::new(RoomRegistry::new(clock).with_max_room_size(config.max_room_size));
        Self { config, registry }
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind and start accepting connections
    pub async fn start(self) -> Result<RelayServerHandle> {
        self.config.validate()?;
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Relay listening on ws://{}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let registry = Arc::clone(&self.registry);
        let max_message_bytes = self.config.max_message_bytes;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted connection from {}", peer_addr);
                            let registry = Arc::clone(&registry);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, registry, max_message_bytes).await {
                                    warn!("Connection from {} ended with error: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => error!("Failed to accept connection: {}", e),
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Relay received shutdown signal");
                        break;
                    }
                }
            }
        });

        Ok(RelayServerHandle {
            local_addr,
            registry: self.registry,
            shutdown_tx,
            task,
        })
    }
}

/// Running relay server
pub struct RelayServerHandle {
    local_addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl RelayServerHandle {
    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL of the relay
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.registry)
    }

    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!("Relay accept loop ended abnormally: {}", e);
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<RoomRegistry>,
    max_message_bytes: usize,
) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| Error::SignalingError(format!("WebSocket handshake failed: {}", e)))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (outbox, mut outbound) = mpsc::unbounded_channel::<ServerMessage>();
    let forward = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode relay message: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                debug!("Connection closed while sending: {}", e);
                break;
            }
        }
    });

    let mut membership: Option<(String, String)> = None;

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket read error: {}", e);
                break;
            }
        };

        if text.len() > max_message_bytes {
            reject(&outbox, format!("message exceeds {} bytes", max_message_bytes));
            continue;
        }

        let message = match ClientMessage::from_json(&text) {
            Ok(message) => message,
            Err(e) => {
                reject(&outbox, format!("malformed message: {}", e));
                continue;
            }
        };

        let result = match membership.as_ref() {
            Some((room, user)) => registry.handle(room, user, message).await,
            None => match message {
                ClientMessage::Join { room, user } => {
                    let joined = registry.join(&room, &user, outbox.clone()).await;
                    if joined.is_ok() {
                        membership = Some((room, user));
                    }
                    joined
                }
                _ => Err(Error::NotPermitted("join a room first".to_string())),
            },
        };

        if let Err(e) = result {
            reject(&outbox, e.to_string());
        }
    }

    if let Some((room, user)) = membership {
        registry.leave(&room, &user).await;
    }
    forward.abort();
    Ok(())
}

fn reject(outbox: &mpsc::UnboundedSender<ServerMessage>, message: String) {
    debug!("Rejecting: {}", message);
    let _ = outbox.send(ServerMessage::Error { message });
}
