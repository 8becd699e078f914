//! Room relay logic
//!
//! Transport-agnostic core of the relay server. Each connected participant
//! is represented by an outbox; the registry routes negotiation payloads
//! without looking inside them, enforces the host-of-record for playback
//! control, stamps movie-control actions with the relay clock, and answers
//! clock probes immediately.

use super::protocol::{ClientMessage, ServerMessage};
use crate::clock::SharedClock;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, instrument, warn};

/// Outbound queue of one connected participant
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Default participant limit per room
pub const DEFAULT_MAX_ROOM_SIZE: usize = 16;

struct Member {
    user: String,
    outbox: Outbox,
}

/// Participants of one room, in join order
pub struct Room {
    id: String,
    members: Vec<Member>,
    host: Option<String>,
}

/// Serializable view of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub id: String,
    pub host: Option<String>,
    pub participants: Vec<String>,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            members: Vec::new(),
            host: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host-of-record
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn participants(&self) -> Vec<String> {
        self.members.iter().map(|m| m.user.clone()).collect()
    }

    pub fn contains(&self, user: &str) -> bool {
        self.members.iter().any(|m| m.user == user)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            id: self.id.clone(),
            host: self.host.clone(),
            participants: self.participants(),
        }
    }

    fn add(&mut self, user: &str, outbox: Outbox) {
        self.members.push(Member {
            user: user.to_string(),
            outbox,
        });
        if self.host.is_none() {
            self.host = Some(user.to_string());
        }
    }

    /// Remove a participant; returns the promoted host if the host left
    fn remove(&mut self, user: &str) -> Option<String> {
        self.members.retain(|m| m.user != user);
        if self.host.as_deref() != Some(user) {
            return None;
        }
        self.host = self.members.first().map(|m| m.user.clone());
        self.host.clone()
    }

    fn send_to(&self, user: &str, message: ServerMessage) -> bool {
        match self.members.iter().find(|m| m.user == user) {
            Some(member) => member.outbox.send(message).is_ok(),
            None => false,
        }
    }

    fn broadcast(&self, except: Option<&str>, message: &ServerMessage) -> usize {
        self.members
            .iter()
            .filter(|m| Some(m.user.as_str()) != except)
            .filter(|m| m.outbox.send(message.clone()).is_ok())
            .count()
    }
}

/// All rooms served by one relay
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
    clock: SharedClock,
    max_room_size: usize,
}

impl RoomRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            clock,
            max_room_size: DEFAULT_MAX_ROOM_SIZE,
        }
    }

    pub fn with_max_room_size(mut self, max: usize) -> Self {
        self.max_room_size = max.max(1);
        self
    }

    /// Add a participant to a room, creating it if needed
    ///
    /// The joiner receives `joined`; everyone else `participant-joined`.
    ///
    /// # Errors
    ///
    /// `NotPermitted` if the name is taken or the room is full.
    #[instrument(skip(self, outbox))]
    pub async fn join(&self, room: &str, user: &str, outbox: Outbox) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let entry = rooms.entry(room.to_string()).or_insert_with(|| Room::new(room));

        if entry.contains(user) {
            return Err(Error::NotPermitted(format!(
                "name {} is already taken in room {}",
                user, room
            )));
        }
        if entry.len() >= self.max_room_size {
            return Err(Error::NotPermitted(format!("room {} is full", room)));
        }

        entry.add(user, outbox);
        let host = entry.host().unwrap_or(user).to_string();
        info!("{} joined {} ({} present, host {})", user, room, entry.len(), host);

        entry.send_to(
            user,
            ServerMessage::Joined {
                user: user.to_string(),
                host,
                participants: entry.participants(),
            },
        );
        entry.broadcast(
            Some(user),
            &ServerMessage::ParticipantJoined {
                user: user.to_string(),
            },
        );
        Ok(())
    }

    /// Remove a participant, promoting a new host if needed
    #[instrument(skip(self))]
    pub async fn leave(&self, room: &str, user: &str) {
        let mut rooms = self.rooms.write().await;
        let Some(entry) = rooms.get_mut(room) else {
            return;
        };
        if !entry.contains(user) {
            return;
        }

        let new_host = entry.remove(user);
        if let Some(host) = &new_host {
            info!("{} left {}, {} is now host", user, room, host);
        } else {
            info!("{} left {}", user, room);
        }
        entry.broadcast(
            None,
            &ServerMessage::ParticipantLeft {
                user: user.to_string(),
                new_host,
            },
        );

        if entry.is_empty() {
            debug!("Room {} is empty, removing", room);
            rooms.remove(room);
        }
    }

    /// Handle a message from a participant who has joined `room`
    ///
    /// # Errors
    ///
    /// - `NotPermitted` for playback control from anyone but the host
    /// - `SignalingError` for a payload addressed to an unknown participant
    pub async fn handle(&self, room: &str, user: &str, message: ClientMessage) -> Result<()> {
        let rooms = self.rooms.read().await;
        let entry = rooms
            .get(room)
            .filter(|r| r.contains(user))
            .ok_or_else(|| Error::SignalingError(format!("{} is not in room {}", user, room)))?;

        let from = user.to_string();
        match message {
            ClientMessage::Join { .. } => Err(Error::NotPermitted(format!(
                "{} already joined room {}",
                user, room
            ))),
            ClientMessage::Offer { sdp, to } => {
                route(entry, user, to, ServerMessage::Offer { sdp, from })
            }
            ClientMessage::Answer { sdp, to } => {
                route(entry, user, to, ServerMessage::Answer { sdp, from })
            }
            ClientMessage::IceCandidate { candidate, to } => route(
                entry,
                user,
                to,
                ServerMessage::IceCandidate { candidate, from },
            ),
            ClientMessage::MovieControl {
                action,
                movie_state,
            } => {
                if entry.host() != Some(user) {
                    warn!("Rejected {:?} from non-host {} in {}", action, user, room);
                    return Err(Error::NotPermitted(
                        "only the host can control playback".to_string(),
                    ));
                }
                let now = self.clock.now_ms();
                let delivered = entry.broadcast(
                    None,
                    &ServerMessage::MovieSync {
                        action,
                        movie_state,
                        timestamp: now.floor() as u64,
                        precision_timestamp: now,
                    },
                );
                debug!("Stamped {:?} at {:.3} for {} participant(s)", action, now, delivered);
                Ok(())
            }
            ClientMessage::TimeSyncRequest { client_time } => {
                entry.send_to(
                    user,
                    ServerMessage::TimeSyncResponse {
                        server_time: self.clock.now_ms(),
                        client_time,
                    },
                );
                Ok(())
            }
        }
    }

    pub async fn room(&self, room: &str) -> Option<RoomSnapshot> {
        self.rooms.read().await.get(room).map(Room::snapshot)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

fn route(room: &Room, sender: &str, to: Option<String>, message: ServerMessage) -> Result<()> {
    match to {
        Some(target) => {
            if room.send_to(&target, message) {
                Ok(())
            } else {
                Err(Error::SignalingError(format!(
                    "{} is not in room {}",
                    target,
                    room.id()
                )))
            }
        }
        None => {
            room.broadcast(Some(sender), &message);
            Ok(())
        }
    }
}
