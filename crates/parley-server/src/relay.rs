//! Room-scoped signaling relay.
//!
//! Tracks which session sits in which room and forwards opaque
//! negotiation envelopes between two members of the same room. The relay
//! never inspects payloads and never reports delivery failure.
//!
//! Locking is two-level: the room map is behind a `RwLock` that is only
//! held long enough to look up or insert an `Arc<Mutex<Room>>`, and every
//! membership change happens under that single room's mutex, so traffic
//! in unrelated rooms never contends.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use parley_shared::protocol::ServerMessage;
use parley_shared::types::{Member, RoomId, SessionId};

use crate::error::RelayError;

/// Queue feeding one session's WebSocket writer.
pub type Outbox = mpsc::Sender<ServerMessage>;

struct Participant {
    session_id: SessionId,
    username: String,
    outbox: Outbox,
}

pub struct Room {
    room_id: RoomId,
    /// Join order is preserved so member lists are stable.
    participants: Vec<Participant>,
    /// Set once the last member leaves; a joiner that raced the teardown
    /// must create a fresh room instead.
    closed: bool,
}

impl Room {
    fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            participants: Vec::new(),
            closed: false,
        }
    }

    fn members(&self) -> Vec<Member> {
        self.participants
            .iter()
            .map(|p| Member {
                user_id: p.session_id.clone(),
                username: p.username.clone(),
            })
            .collect()
    }

    fn position(&self, session_id: &SessionId) -> Option<usize> {
        self.participants
            .iter()
            .position(|p| &p.session_id == session_id)
    }

    fn deliver(&self, participant: &Participant, message: ServerMessage) {
        match participant.outbox.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    room = %self.room_id,
                    session = %participant.session_id.short(),
                    "Dropping envelope for slow session"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    room = %self.room_id,
                    session = %participant.session_id.short(),
                    "Session outbox already closed"
                );
            }
        }
    }

    fn broadcast(&self, message: &ServerMessage, exclude: Option<&SessionId>) {
        for participant in &self.participants {
            if Some(&participant.session_id) == exclude {
                continue;
            }
            self.deliver(participant, message.clone());
        }
    }

    fn broadcast_member_list(&self) {
        self.broadcast(
            &ServerMessage::UserList {
                users: self.members(),
            },
            None,
        );
    }
}

/// Trim a `join` request's name and room, rejecting blank ones.
pub fn check_join<'a>(username: &'a str, room_id: &'a str) -> Result<(&'a str, &'a str), RelayError> {
    let username = username.trim();
    let room_id = room_id.trim();
    if username.is_empty() {
        return Err(RelayError::MissingName);
    }
    if room_id.is_empty() {
        return Err(RelayError::MissingRoom);
    }
    Ok((username, room_id))
}

/// A session's current seat in a room, owned by its connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub session_id: SessionId,
    pub room_id: RoomId,
}

#[derive(Clone, Default)]
pub struct Relay {
    rooms: Arc<RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seat a new session in `room_id`.
    ///
    /// The caller receives `room-joined` (with everyone already present)
    /// on its outbox; the others receive `user-joined`; then the whole
    /// room gets a fresh `user-list`.
    pub async fn join(
        &self,
        username: &str,
        room_id: &str,
        outbox: Outbox,
    ) -> Result<Membership, RelayError> {
        let (username, room_id) = check_join(username, room_id)?;
        let room_id = RoomId::from(room_id);
        let session_id = SessionId::generate();

        loop {
            let room = self.open_room(&room_id).await;
            let mut guard = room.lock().await;
            if guard.closed {
                drop(guard);
                self.discard_room(&room_id, &room).await;
                continue;
            }

            let existing = guard.members();
            guard.participants.push(Participant {
                session_id: session_id.clone(),
                username: username.to_string(),
                outbox,
            });

            let joined = &guard.participants[guard.participants.len() - 1];
            guard.deliver(
                joined,
                ServerMessage::RoomJoined {
                    room_id: room_id.clone(),
                    user_id: session_id.clone(),
                    users: existing,
                },
            );
            guard.broadcast(
                &ServerMessage::UserJoined {
                    user_id: session_id.clone(),
                    username: username.to_string(),
                },
                Some(&session_id),
            );
            guard.broadcast_member_list();

            info!(
                room = %room_id,
                session = %session_id.short(),
                username = %username,
                members = guard.participants.len(),
                "Session joined room"
            );

            return Ok(Membership {
                session_id,
                room_id,
            });
        }
    }

    /// Forward `signal` from `from` to `target_id` if both share the room.
    /// Anything else is dropped without telling the sender.
    pub async fn relay_envelope(&self, from: &Membership, target_id: &SessionId, signal: Value) {
        let Some(room) = self.rooms.read().await.get(&from.room_id).cloned() else {
            debug!(room = %from.room_id, "Signal for vanished room dropped");
            return;
        };

        let guard = room.lock().await;
        if guard.position(&from.session_id).is_none() {
            debug!(session = %from.session_id.short(), "Signal from non-member dropped");
            return;
        }

        match guard.position(target_id) {
            Some(idx) => {
                let target = &guard.participants[idx];
                debug!(
                    room = %from.room_id,
                    from = %from.session_id.short(),
                    to = %target_id.short(),
                    "Relaying signal"
                );
                guard.deliver(
                    target,
                    ServerMessage::Signal {
                        from_id: from.session_id.clone(),
                        signal,
                    },
                );
            }
            None => {
                debug!(
                    room = %from.room_id,
                    target = %target_id.short(),
                    "Signal target not in room, dropped"
                );
            }
        }
    }

    /// Remove the session from its room. The last member out destroys the
    /// room; otherwise the rest are told who left and get a new list.
    pub async fn leave(&self, membership: Membership) {
        let Some(room) = self.rooms.read().await.get(&membership.room_id).cloned() else {
            return;
        };

        let mut guard = room.lock().await;
        let Some(idx) = guard.position(&membership.session_id) else {
            return;
        };
        let departed = guard.participants.remove(idx);

        if guard.participants.is_empty() {
            guard.closed = true;
            drop(guard);
            self.discard_room(&membership.room_id, &room).await;
            info!(room = %membership.room_id, "Room is empty and removed");
            return;
        }

        guard.broadcast(
            &ServerMessage::UserLeft {
                user_id: departed.session_id.clone(),
                username: departed.username.clone(),
            },
            None,
        );
        guard.broadcast_member_list();

        info!(
            room = %membership.room_id,
            session = %departed.session_id.short(),
            username = %departed.username,
            members = guard.participants.len(),
            "Session left room"
        );
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn members(&self, room_id: &RoomId) -> Vec<Member> {
        let Some(room) = self.rooms.read().await.get(room_id).cloned() else {
            return Vec::new();
        };
        let guard = room.lock().await;
        guard.members()
    }

    async fn open_room(&self, room_id: &RoomId) -> Arc<Mutex<Room>> {
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return room.clone();
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                info!(room = %room_id, "Created room");
                Arc::new(Mutex::new(Room::new(room_id.clone())))
            })
            .clone()
    }

    /// Drop the map entry only if it still points at this (closed) room.
    async fn discard_room(&self, room_id: &RoomId, room: &Arc<Mutex<Room>>) {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(room_id)
            .is_some_and(|current| Arc::ptr_eq(current, room))
        {
            rooms.remove(room_id);
        }
    }
}
