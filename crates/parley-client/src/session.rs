//! Session coordinator: one per participant.
//!
//! Owns the room membership view, one [`PeerRecord`] per remote member and
//! the message list. Everything that touches that state arrives as a
//! [`SessionInput`] and is handled one at a time by [`SessionCoordinator::run`],
//! so no locking is needed on the client side.
//!
//! Outgoing file chunks are pumped by the same loop between inputs, which
//! makes a `user-left` that lands mid-transfer take effect before the next
//! chunk for that peer is read.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_shared::crypto::KeyPair;
use parley_shared::protocol::{ClientMessage, PeerEnvelope, ServerMessage};
use parley_shared::types::{Member, PeerId, RoomId};

use crate::channel::{ChannelState, SecureChannel};
use crate::config::ClientConfig;
use crate::error::{SessionError, TransferError};
use crate::events::SessionEvent;
use crate::messages::{self, Message, MessageLog, ReactionOutcome};
use crate::transfer::{
    FileTransferEngine, OutgoingFile, OutgoingStep, ReceivedFile, TransferDirection,
    TransferEvent, TransferProgress,
};
use crate::transport::PeerTransport;

// ---------------------------------------------------------------------------
// Inputs / commands
// ---------------------------------------------------------------------------

/// Everything the session loop reacts to.
#[derive(Debug)]
pub enum SessionInput {
    /// Envelope from the signaling relay.
    Signaling(ServerMessage),
    /// The signaling connection ended.
    SignalingClosed,
    /// The direct link to a peer is ready for data.
    LinkOpen(PeerId),
    LinkClosed(PeerId),
    /// Raw bytes that arrived on a peer's direct link.
    PeerData { peer_id: PeerId, data: Vec<u8> },
    /// Repeat our display name to a peer.
    AnnounceName(PeerId),
    Command(SessionCommand),
}

/// Requests from the local user.
#[derive(Debug)]
pub enum SessionCommand {
    /// Join a room, leaving the current one first.
    JoinRoom { room_id: RoomId },
    SendText {
        body: String,
        reply: oneshot::Sender<Result<SendSummary, SessionError>>,
    },
    SendFile {
        file: OutgoingFile,
        reply: oneshot::Sender<Result<SendSummary, SessionError>>,
    },
    React {
        message_id: String,
        emoji: String,
        reply: oneshot::Sender<Result<usize, SessionError>>,
    },
    DeleteMessage { message_id: String },
    TogglePin { message_id: String },
    /// Leave the room and stop the loop.
    Shutdown,
}

/// Outcome of a send: the message or file id and how many peers it went to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendSummary {
    pub id: String,
    pub peers: usize,
}

/// Counters for the current room, reset on every switch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub files_sent: u64,
    pub decrypt_failures: u64,
}

/// Channels wiring a coordinator to the outside world.
pub struct SessionLinks {
    pub signaling: mpsc::Sender<ClientMessage>,
    /// Sender side of the loop's own inbox, used for timed announcements.
    pub inbox: mpsc::UnboundedSender<SessionInput>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

// ---------------------------------------------------------------------------
// Peer records
// ---------------------------------------------------------------------------

struct PeerRecord {
    name: String,
    channel: SecureChannel,
    transfers: FileTransferEngine,
    link_open: bool,
    announcer: Option<JoinHandle<()>>,
}

impl PeerRecord {
    fn stop_announcing(&mut self) {
        if let Some(handle) = self.announcer.take() {
            handle.abort();
        }
    }
}

impl Drop for PeerRecord {
    fn drop(&mut self) {
        self.stop_announcing();
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct SessionCoordinator<T: PeerTransport> {
    config: ClientConfig,
    username: String,
    transport: T,
    signaling: mpsc::Sender<ClientMessage>,
    inbox: mpsc::UnboundedSender<SessionInput>,
    events: mpsc::UnboundedSender<SessionEvent>,

    self_id: Option<PeerId>,
    room_id: Option<RoomId>,
    /// Set between sending `join` and the matching `room-joined`.
    pending_room: Option<RoomId>,
    roster: Vec<Member>,
    peers: HashMap<PeerId, PeerRecord>,
    messages: MessageLog,
    stats: SessionStats,
}

impl<T: PeerTransport> SessionCoordinator<T> {
    /// Fails only when local key material cannot be produced at all.
    pub fn new(
        config: ClientConfig,
        username: impl Into<String>,
        transport: T,
        links: SessionLinks,
    ) -> Result<Self, SessionError> {
        KeyPair::generate().map_err(|e| {
            error!(error = %e, "Cannot acquire local key material");
            SessionError::KeyMaterial(e)
        })?;

        Ok(Self {
            config,
            username: username.into(),
            transport,
            signaling: links.signaling,
            inbox: links.inbox,
            events: links.events,
            self_id: None,
            room_id: None,
            pending_room: None,
            roster: Vec::new(),
            peers: HashMap::new(),
            messages: MessageLog::new(),
            stats: SessionStats::default(),
        })
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.inbox.clone())
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn self_id(&self) -> Option<&PeerId> {
        self.self_id.as_ref()
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn peer_name(&self, peer_id: &PeerId) -> Option<&str> {
        self.peers.get(peer_id).map(|r| r.name.as_str())
    }

    pub fn channel_state(&self, peer_id: &PeerId) -> Option<ChannelState> {
        self.peers.get(peer_id).map(|r| r.channel.state())
    }

    pub fn has_outgoing(&self) -> bool {
        self.peers.values().any(|r| r.transfers.has_outgoing())
    }

    /// Roster with names preferring the last announcement.
    pub fn members(&self) -> Vec<Member> {
        self.roster
            .iter()
            .map(|m| {
                let username = match self.peers.get(&m.user_id) {
                    Some(record) => record.name.clone(),
                    None => m.username.clone(),
                };
                Member {
                    user_id: m.user_id.clone(),
                    username,
                }
            })
            .collect()
    }

    /// Drive the session until [`SessionCommand::Shutdown`].
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionInput>) {
        info!(user = %self.username, "Session loop started");

        'session: loop {
            // Everything already queued goes first, so departures land
            // between chunks.
            loop {
                match inbox.try_recv() {
                    Ok(input) => {
                        if !self.handle_input(input).await {
                            break 'session;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => break 'session,
                }
            }

            if self.has_outgoing() {
                if self.pump_outgoing().await {
                    tokio::time::sleep(self.config.pace_delay).await;
                }
                continue;
            }

            match inbox.recv().await {
                Some(input) => {
                    if !self.handle_input(input).await {
                        break;
                    }
                }
                None => break,
            }
        }

        info!(user = %self.username, "Session loop ended");
    }

    /// Apply one input. Returns `false` once the session should stop.
    pub async fn handle_input(&mut self, input: SessionInput) -> bool {
        match input {
            SessionInput::Signaling(message) => self.on_signaling(message),
            SessionInput::SignalingClosed => {
                warn!("Signaling connection lost");
                self.emit(SessionEvent::warning("Lost connection to the signaling server"));
            }
            SessionInput::LinkOpen(peer_id) => self.on_link_open(&peer_id),
            SessionInput::LinkClosed(peer_id) => self.on_link_closed(&peer_id),
            SessionInput::PeerData { peer_id, data } => self.on_peer_data(&peer_id, &data),
            SessionInput::AnnounceName(peer_id) => self.announce_name(&peer_id),
            SessionInput::Command(command) => return self.on_command(command).await,
        }
        true
    }

    async fn on_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::JoinRoom { room_id } => {
                if let Err(e) = self.join_room(room_id).await {
                    self.emit(SessionEvent::error(format!("Could not join room: {e}")));
                }
            }
            SessionCommand::SendText { body, reply } => {
                let _ = reply.send(self.send_text(&body));
            }
            SessionCommand::SendFile { file, reply } => {
                let result = self.send_file(file).await;
                let _ = reply.send(result);
            }
            SessionCommand::React {
                message_id,
                emoji,
                reply,
            } => {
                let _ = reply.send(self.react(&message_id, &emoji));
            }
            SessionCommand::DeleteMessage { message_id } => {
                self.delete_message(&message_id);
            }
            SessionCommand::TogglePin { message_id } => {
                self.toggle_pin(&message_id);
            }
            SessionCommand::Shutdown => {
                self.shutdown().await;
                return false;
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Room lifecycle
    // -----------------------------------------------------------------------

    /// Leave the current room (if any), drop all per-room state, then ask
    /// the relay for `room_id`.
    pub async fn join_room(&mut self, room_id: RoomId) -> Result<(), SessionError> {
        let left = if self.room_id.is_some() || self.pending_room.is_some() {
            send_signal(&self.signaling, ClientMessage::Leave).await
        } else {
            Ok(())
        };
        // Old-room state goes even when the relay is unreachable.
        self.reset_room_state();
        left?;

        info!(room = %room_id, user = %self.username, "Joining room");
        send_signal(
            &self.signaling,
            ClientMessage::Join {
                username: self.username.clone(),
                room_id: room_id.to_string(),
            },
        )
        .await?;
        self.pending_room = Some(room_id);
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.room_id.is_some() || self.pending_room.is_some() {
            if let Err(e) = send_signal(&self.signaling, ClientMessage::Leave).await {
                debug!(error = %e, "Leave not sent");
            }
        }
        self.reset_room_state();
    }

    fn reset_room_state(&mut self) {
        for (peer_id, _) in self.peers.drain() {
            self.transport.close(&peer_id);
        }
        self.roster.clear();
        self.messages.clear();
        self.stats = SessionStats::default();
        self.self_id = None;
        self.room_id = None;
        self.pending_room = None;
    }

    fn on_signaling(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::RoomJoined {
                room_id,
                user_id,
                users,
            } => self.on_room_joined(room_id, user_id, users),
            _ if self.pending_room.is_some() || self.room_id.is_none() => {
                debug!("Ignoring signaling envelope outside a joined room");
            }
            ServerMessage::UserJoined { user_id, username } => {
                if self.self_id.as_ref() == Some(&user_id) {
                    return;
                }
                let member = Member {
                    user_id: user_id.clone(),
                    username: username.clone(),
                };
                if !self.roster.iter().any(|m| m.user_id == user_id) {
                    self.roster.push(member.clone());
                }
                self.bring_up(&member, false);
                self.emit(SessionEvent::PeerJoined { peer_id: user_id, username });
                self.check_capacity();
            }
            ServerMessage::UserLeft { user_id, username } => {
                self.roster.retain(|m| m.user_id != user_id);
                if self.teardown(&user_id) {
                    self.emit(SessionEvent::info(format!("{username} left the room")));
                }
                self.emit(SessionEvent::PeerLeft { peer_id: user_id, username });
            }
            ServerMessage::UserList { users } => self.on_user_list(users),
            ServerMessage::Signal { from_id, signal } => {
                if self.peers.contains_key(&from_id) {
                    self.transport.accept_signal(&from_id, signal);
                } else {
                    debug!(from = %from_id, "Signal from unknown peer dropped");
                }
            }
        }
    }

    fn on_room_joined(&mut self, room_id: RoomId, self_id: PeerId, users: Vec<Member>) {
        if self.pending_room.as_ref() != Some(&room_id) {
            debug!(room = %room_id, "Stale room-joined ignored");
            return;
        }
        self.pending_room = None;
        self.room_id = Some(room_id.clone());
        self.self_id = Some(self_id.clone());
        info!(room = %room_id, id = %self_id, existing = users.len(), "Joined room");

        // Newcomers dial everyone already present.
        for member in users.iter().filter(|m| m.user_id != self_id) {
            self.bring_up(member, true);
        }
        self.roster = users;
        self.roster.push(Member {
            user_id: self_id.clone(),
            username: self.username.clone(),
        });

        self.emit(SessionEvent::RoomJoined {
            room_id: room_id.clone(),
            self_id,
            members: self.members(),
        });
        self.emit(SessionEvent::info(format!("Connected to room {room_id}")));
        self.check_capacity();
    }

    /// Reconcile peer records with the relay's authoritative member list.
    fn on_user_list(&mut self, users: Vec<Member>) {
        let Some(self_id) = self.self_id.clone() else {
            return;
        };
        let listed: HashSet<&PeerId> = users.iter().map(|m| &m.user_id).collect();

        let stale: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|id| !listed.contains(id))
            .cloned()
            .collect();
        for peer_id in stale {
            let username = self.peer_name(&peer_id).unwrap_or_default().to_string();
            debug!(peer = %peer_id, "Peer missing from member list, tearing down");
            self.teardown(&peer_id);
            self.emit(SessionEvent::PeerLeft { peer_id, username });
        }

        for member in users.iter().filter(|m| m.user_id != self_id) {
            if !self.peers.contains_key(&member.user_id) {
                debug!(peer = %member.user_id, "Member list names an unknown peer, bringing up");
                self.bring_up(member, false);
                self.emit(SessionEvent::PeerJoined {
                    peer_id: member.user_id.clone(),
                    username: member.username.clone(),
                });
            }
        }

        self.roster = users;
        self.emit(SessionEvent::RosterChanged {
            members: self.members(),
        });
    }

    fn check_capacity(&self) {
        let size = self.peers.len() + 1;
        if size > self.config.room_capacity {
            self.emit(SessionEvent::warning(format!(
                "{size} participants in the room; direct links may degrade above {}",
                self.config.room_capacity
            )));
        }
    }

    fn bring_up(&mut self, member: &Member, initiator: bool) {
        if self.peers.contains_key(&member.user_id) {
            return;
        }

        let mut channel = SecureChannel::new();
        if let Err(e) = channel.generate_key_pair() {
            error!(peer = %member.user_id, error = %e, "Key generation failed");
            self.emit(SessionEvent::error(format!(
                "Could not create keys for {}: {e}",
                member.username
            )));
            return;
        }

        self.peers.insert(
            member.user_id.clone(),
            PeerRecord {
                name: member.username.clone(),
                channel,
                transfers: FileTransferEngine::new(self.config.chunk_size, self.config.pace_every),
                link_open: false,
                announcer: None,
            },
        );
        self.transport.open(&member.user_id, initiator);
        debug!(peer = %member.user_id, initiator, "Opening link");
    }

    /// Drop the record, its channel and every transfer with it.
    fn teardown(&mut self, peer_id: &PeerId) -> bool {
        let Some(record) = self.peers.remove(peer_id) else {
            return false;
        };
        self.transport.close(peer_id);
        info!(
            peer = %peer_id,
            incoming = record.transfers.incoming_count(),
            outgoing = record.transfers.outgoing_count(),
            "Peer removed"
        );
        true
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    fn on_link_open(&mut self, peer_id: &PeerId) {
        let Some(record) = self.peers.get_mut(peer_id) else {
            debug!(peer = %peer_id, "Link opened for unknown peer");
            return;
        };
        record.link_open = true;

        match record.channel.export_public_key() {
            Ok(public_key) => {
                let envelope = PeerEnvelope::KeyExchange { public_key };
                if send_envelope(&mut self.transport, peer_id, &envelope) {
                    record.channel.mark_key_sent();
                } else {
                    warn!(peer = %peer_id, "Key exchange not sent");
                }
            }
            Err(e) => warn!(peer = %peer_id, error = %e, "No public key to send"),
        }

        let announce = PeerEnvelope::DisplayNameShare {
            name: self.username.clone(),
        };
        send_envelope(&mut self.transport, peer_id, &announce);

        let target = peer_id.clone();
        let announcer = self
            .config
            .name_announce
            .spawn(self.inbox.clone(), move || SessionInput::AnnounceName(target.clone()));
        if let Some(previous) = record.announcer.replace(announcer) {
            previous.abort();
        }

        let name = record.name.clone();
        info!(peer = %peer_id, "Link open, key exchange started");
        self.emit(SessionEvent::info(format!("Connected to {name}")));
    }

    /// The link is gone but the peer may still be in the room; keep the
    /// channel and drop what was in flight.
    fn on_link_closed(&mut self, peer_id: &PeerId) {
        let Some(record) = self.peers.get_mut(peer_id) else {
            return;
        };
        record.link_open = false;
        record.stop_announcing();
        record.transfers = FileTransferEngine::new(self.config.chunk_size, self.config.pace_every);

        let name = record.name.clone();
        warn!(peer = %peer_id, "Link closed");
        self.emit(SessionEvent::warning(format!("Connection to {name} closed")));
    }

    fn announce_name(&mut self, peer_id: &PeerId) {
        if !self.peers.get(peer_id).is_some_and(|r| r.link_open) {
            return;
        }
        let envelope = PeerEnvelope::DisplayNameShare {
            name: self.username.clone(),
        };
        send_envelope(&mut self.transport, peer_id, &envelope);
    }

    // -----------------------------------------------------------------------
    // Inbound peer envelopes
    // -----------------------------------------------------------------------

    fn on_peer_data(&mut self, peer_id: &PeerId, data: &[u8]) {
        if !self.peers.contains_key(peer_id) {
            debug!(peer = %peer_id, "Data from unknown peer dropped");
            return;
        }
        let envelope = match PeerEnvelope::from_bytes(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Dropping malformed peer envelope");
                return;
            }
        };
        debug!(peer = %peer_id, kind = envelope.kind(), "Peer envelope received");

        match envelope {
            PeerEnvelope::KeyExchange { public_key } => self.on_key_exchange(peer_id, &public_key),
            PeerEnvelope::DisplayNameShare { name } => self.on_display_name(peer_id, &name),
            PeerEnvelope::EncryptedMessage {
                data,
                message_id,
                timestamp,
            } => self.on_message(peer_id, &data, message_id, timestamp),
            PeerEnvelope::EmojiReaction {
                message_id,
                emoji,
                username,
            } => self.on_reaction(&message_id, &emoji, &username),
            PeerEnvelope::EncryptedFileMetadata { data } => self.on_file_metadata(peer_id, &data),
            PeerEnvelope::EncryptedFileChunk { data } => self.on_file_chunk(peer_id, &data),
        }
    }

    fn on_key_exchange(&mut self, peer_id: &PeerId, public_key: &str) {
        let Some(record) = self.peers.get_mut(peer_id) else {
            return;
        };

        // Their key beat ours onto the wire; answer so both sides derive.
        if record.channel.state() == ChannelState::NoKey {
            if let Ok(own) = record.channel.export_public_key() {
                let envelope = PeerEnvelope::KeyExchange { public_key: own };
                if send_envelope(&mut self.transport, peer_id, &envelope) {
                    record.channel.mark_key_sent();
                }
            }
        }

        let was_established = record.channel.is_established();
        let result = record.channel.derive_shared_key(public_key);
        let name = record.name.clone();

        match result {
            Ok(()) if !was_established => {
                info!(peer = %peer_id, "Secure channel established");
                self.emit(SessionEvent::ChannelReady {
                    peer_id: peer_id.clone(),
                });
                self.emit(SessionEvent::info(format!("Secure channel with {name} ready")));
            }
            Ok(()) => {}
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Key exchange failed");
                self.emit(SessionEvent::error(format!(
                    "Key exchange with {name} failed: {e}"
                )));
            }
        }
    }

    fn on_display_name(&mut self, peer_id: &PeerId, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        let Some(record) = self.peers.get_mut(peer_id) else {
            return;
        };
        if record.name == name {
            return;
        }
        debug!(peer = %peer_id, old = %record.name, new = %name, "Display name updated");
        record.name = name.to_string();

        for message_id in self.messages.relabel_sender(peer_id, name) {
            self.emit(SessionEvent::MessageUpdated { message_id });
        }
        self.emit(SessionEvent::RosterChanged {
            members: self.members(),
        });
    }

    fn on_message(
        &mut self,
        peer_id: &PeerId,
        data: &str,
        message_id: Option<String>,
        timestamp: i64,
    ) {
        let Some(record) = self.peers.get(peer_id) else {
            return;
        };
        let sender = record.name.clone();

        let body = match record.channel.decrypt(data) {
            Ok(plaintext) => match String::from_utf8(plaintext) {
                Ok(body) => body,
                Err(_) => {
                    warn!(peer = %peer_id, "Message body is not UTF-8");
                    self.emit(SessionEvent::warning(format!(
                        "Unreadable message from {sender}"
                    )));
                    return;
                }
            },
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Failed to decrypt message");
                self.stats.decrypt_failures += 1;
                self.emit(SessionEvent::error(format!(
                    "Could not decrypt a message from {sender}"
                )));
                return;
            }
        };

        let id = message_id.unwrap_or_else(|| messages::message_id(peer_id, timestamp));
        let message = Message::new(id, sender, peer_id.clone(), body, timestamp);
        self.messages.push(message.clone());
        self.emit(SessionEvent::MessageAdded(message));
    }

    fn on_reaction(&mut self, message_id: &str, emoji: &str, username: &str) {
        match self.messages.apply_reaction(message_id, emoji, username) {
            ReactionOutcome::Applied => self.emit(SessionEvent::MessageUpdated {
                message_id: message_id.to_string(),
            }),
            ReactionOutcome::Duplicate => {
                debug!(message = %message_id, user = %username, "Repeated reaction ignored");
            }
            ReactionOutcome::UnknownMessage => {
                debug!(message = %message_id, "Reaction for unknown message dropped");
            }
        }
    }

    fn on_file_metadata(&mut self, peer_id: &PeerId, data: &str) {
        let Some(record) = self.peers.get_mut(peer_id) else {
            return;
        };
        let result = record.transfers.handle_metadata(&record.channel, data);
        let name = record.name.clone();

        match result {
            Ok(TransferEvent::Progress(progress)) => {
                info!(peer = %peer_id, file = %progress.file_name, chunks = progress.total, "Receiving file");
                self.emit(SessionEvent::info(format!(
                    "Receiving {} from {name}",
                    progress.file_name
                )));
                self.emit(SessionEvent::TransferProgress {
                    peer_id: peer_id.clone(),
                    progress,
                });
            }
            Ok(TransferEvent::Received(file)) => self.on_file_received(peer_id, &name, file),
            Err(e) => self.on_transfer_error(peer_id, &name, e),
        }
    }

    fn on_file_chunk(&mut self, peer_id: &PeerId, data: &str) {
        let Some(record) = self.peers.get_mut(peer_id) else {
            return;
        };
        let result = record.transfers.handle_chunk(&record.channel, data);
        let name = record.name.clone();

        match result {
            Ok(Some(TransferEvent::Progress(progress))) => {
                self.emit(SessionEvent::TransferProgress {
                    peer_id: peer_id.clone(),
                    progress,
                });
            }
            Ok(Some(TransferEvent::Received(file))) => self.on_file_received(peer_id, &name, file),
            Ok(None) => {}
            Err(e) => self.on_transfer_error(peer_id, &name, e),
        }
    }

    fn on_file_received(&mut self, peer_id: &PeerId, sender: &str, file: ReceivedFile) {
        if file.verified {
            info!(peer = %peer_id, file = %file.file_name, size = file.file_size, "File received");
            self.emit(SessionEvent::info(format!(
                "Received {} from {sender}, integrity verified",
                file.file_name
            )));
        } else {
            self.emit(SessionEvent::error(format!(
                "{} from {sender} failed the integrity check and was discarded",
                file.file_name
            )));
        }
        self.emit(SessionEvent::FileReceived {
            peer_id: peer_id.clone(),
            file,
        });
    }

    fn on_transfer_error(&mut self, peer_id: &PeerId, sender: &str, error: TransferError) {
        warn!(peer = %peer_id, error = %error, "Dropping file data");
        if matches!(error, TransferError::Channel(_)) {
            self.stats.decrypt_failures += 1;
            self.emit(SessionEvent::error(format!(
                "Could not decrypt file data from {sender}"
            )));
        } else {
            self.emit(SessionEvent::warning(format!(
                "Dropped malformed file data from {sender}"
            )));
        }
    }

    // -----------------------------------------------------------------------
    // Local actions
    // -----------------------------------------------------------------------

    /// Encrypt `body` separately for every peer with an established channel
    /// and record it locally.
    pub fn send_text(&mut self, body: &str) -> Result<SendSummary, SessionError> {
        let self_id = self.self_id.clone().ok_or(SessionError::NotJoined)?;
        if self.peers.is_empty() {
            self.emit(SessionEvent::warning("No peers connected"));
            return Err(SessionError::NoPeers);
        }

        let timestamp = Utc::now().timestamp_millis();
        let id = messages::message_id(&self_id, timestamp);

        let mut delivered = 0;
        for (peer_id, record) in &self.peers {
            if !record.link_open || !record.channel.is_established() {
                debug!(peer = %peer_id, "Skipping peer without secure channel");
                continue;
            }
            let data = match record.channel.encrypt(body.as_bytes()) {
                Ok(data) => data,
                Err(e) => {
                    warn!(peer = %peer_id, error = %e, "Encryption failed");
                    continue;
                }
            };
            let envelope = PeerEnvelope::EncryptedMessage {
                data,
                message_id: Some(id.clone()),
                timestamp,
            };
            if send_envelope(&mut self.transport, peer_id, &envelope) {
                delivered += 1;
            }
        }

        let message = Message::new(
            id.clone(),
            self.username.clone(),
            self_id,
            body.to_string(),
            timestamp,
        );
        self.messages.push(message.clone());
        self.stats.messages_sent += 1;
        self.emit(SessionEvent::MessageAdded(message));
        if delivered == 0 {
            self.emit(SessionEvent::warning(
                "Message not delivered: no secure channel is ready yet",
            ));
        }

        Ok(SendSummary {
            id,
            peers: delivered,
        })
    }

    /// Offer `file` to every peer with an established channel. Chunks are
    /// sent afterwards by [`pump_outgoing`](Self::pump_outgoing).
    pub async fn send_file(&mut self, file: OutgoingFile) -> Result<SendSummary, SessionError> {
        if self.self_id.is_none() {
            return Err(SessionError::NotJoined);
        }
        if self.peers.is_empty() {
            self.emit(SessionEvent::warning("No peers connected"));
            return Err(SessionError::NoPeers);
        }

        let total = file.total_chunks(self.config.chunk_size)?;
        let file_id = Uuid::new_v4().to_string();

        let mut started = 0;
        for (peer_id, record) in self.peers.iter_mut() {
            if !record.link_open || !record.channel.is_established() {
                continue;
            }
            let envelope = match record
                .transfers
                .start_send(&record.channel, &file_id, &file)
                .await
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(peer = %peer_id, error = %e, "Could not start transfer");
                    continue;
                }
            };

            if send_envelope(&mut self.transport, peer_id, &envelope) {
                started += 1;
                let _ = self.events.send(SessionEvent::TransferProgress {
                    peer_id: peer_id.clone(),
                    progress: TransferProgress {
                        file_id: file_id.clone(),
                        file_name: file.file_name.clone(),
                        done: 0,
                        total,
                        direction: TransferDirection::Outgoing,
                    },
                });
            } else {
                record.transfers.abort_outgoing(&file_id);
            }
        }

        info!(file_id = %file_id, file = %file.file_name, size = file.file_size, peers = started, "File offered");
        if started == 0 {
            self.emit(SessionEvent::warning(format!(
                "{} not sent: no secure channel is ready yet",
                file.file_name
            )));
        } else {
            self.stats.files_sent += 1;
        }

        Ok(SendSummary {
            id: file_id,
            peers: started,
        })
    }

    /// Send the next chunk of every peer's current outgoing file. Returns
    /// whether the loop should pause before the next round.
    pub async fn pump_outgoing(&mut self) -> bool {
        let mut pace = false;

        for (peer_id, record) in self.peers.iter_mut() {
            let Some(step) = record.transfers.next_chunk(&record.channel).await else {
                continue;
            };

            match step {
                OutgoingStep::Chunk(chunk) => {
                    if !send_envelope(&mut self.transport, peer_id, &chunk.envelope) {
                        record.transfers.abort_outgoing(&chunk.file_id);
                        warn!(peer = %peer_id, file_id = %chunk.file_id, "Chunk not sent, transfer stopped");
                        let _ = self.events.send(SessionEvent::warning(format!(
                            "Stopped sending {} to {}: link unavailable",
                            chunk.progress.file_name, record.name
                        )));
                        continue;
                    }

                    pace |= chunk.pace;
                    if chunk.progress.done == chunk.progress.total {
                        info!(peer = %peer_id, file_id = %chunk.file_id, "File sent");
                        let _ = self.events.send(SessionEvent::info(format!(
                            "Sent {} to {}",
                            chunk.progress.file_name, record.name
                        )));
                    }
                    let _ = self.events.send(SessionEvent::TransferProgress {
                        peer_id: peer_id.clone(),
                        progress: chunk.progress,
                    });
                }
                OutgoingStep::Failed {
                    file_id,
                    file_name,
                    error,
                } => {
                    warn!(peer = %peer_id, file_id = %file_id, error = %error, "Outgoing transfer failed");
                    let _ = self.events.send(SessionEvent::error(format!(
                        "Sending {file_name} to {} failed: {error}",
                        record.name
                    )));
                }
            }
        }

        pace
    }

    /// React as ourselves. Returns how many peers the reaction went to; a
    /// repeat of our own reaction changes nothing and sends nothing.
    pub fn react(&mut self, message_id: &str, emoji: &str) -> Result<usize, SessionError> {
        match self.messages.apply_reaction(message_id, emoji, &self.username) {
            ReactionOutcome::UnknownMessage => {
                return Err(SessionError::UnknownMessage(message_id.to_string()))
            }
            ReactionOutcome::Duplicate => return Ok(0),
            ReactionOutcome::Applied => {}
        }
        self.emit(SessionEvent::MessageUpdated {
            message_id: message_id.to_string(),
        });

        let envelope = PeerEnvelope::EmojiReaction {
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
            username: self.username.clone(),
        };
        let mut delivered = 0;
        for (peer_id, record) in &self.peers {
            if record.link_open && send_envelope(&mut self.transport, peer_id, &envelope) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Local only.
    pub fn delete_message(&mut self, message_id: &str) -> bool {
        let deleted = self.messages.delete(message_id);
        if deleted {
            self.emit(SessionEvent::MessageDeleted {
                message_id: message_id.to_string(),
            });
        }
        deleted
    }

    /// Local only.
    pub fn toggle_pin(&mut self, message_id: &str) -> Option<bool> {
        let pinned = self.messages.toggle_pin(message_id)?;
        self.emit(SessionEvent::MessageUpdated {
            message_id: message_id.to_string(),
        });
        Some(pinned)
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("No event listener");
        }
    }
}

async fn send_signal(
    signaling: &mpsc::Sender<ClientMessage>,
    message: ClientMessage,
) -> Result<(), SessionError> {
    signaling
        .send(message)
        .await
        .map_err(|_| SessionError::SignalingClosed)
}

fn send_envelope<T: PeerTransport>(transport: &mut T, peer_id: &PeerId, envelope: &PeerEnvelope) -> bool {
    match envelope.to_bytes() {
        Ok(bytes) => transport.send(peer_id, &bytes),
        Err(e) => {
            warn!(peer = %peer_id, kind = envelope.kind(), error = %e, "Failed to encode envelope");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable front door to a running session loop.
#[derive(Clone)]
pub struct SessionHandle {
    inbox: mpsc::UnboundedSender<SessionInput>,
}

impl SessionHandle {
    pub fn new(inbox: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { inbox }
    }

    fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.inbox
            .send(SessionInput::Command(command))
            .map_err(|_| SessionError::SessionClosed)
    }

    pub fn join_room(&self, room_id: impl Into<RoomId>) -> Result<(), SessionError> {
        self.command(SessionCommand::JoinRoom {
            room_id: room_id.into(),
        })
    }

    pub async fn send_text(&self, body: impl Into<String>) -> Result<SendSummary, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::SendText {
            body: body.into(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    pub async fn send_file(&self, file: OutgoingFile) -> Result<SendSummary, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::SendFile { file, reply })?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    pub async fn react(
        &self,
        message_id: impl Into<String>,
        emoji: impl Into<String>,
    ) -> Result<usize, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::React {
            message_id: message_id.into(),
            emoji: emoji.into(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    pub fn delete_message(&self, message_id: impl Into<String>) -> Result<(), SessionError> {
        self.command(SessionCommand::DeleteMessage {
            message_id: message_id.into(),
        })
    }

    pub fn toggle_pin(&self, message_id: impl Into<String>) -> Result<(), SessionError> {
        self.command(SessionCommand::TogglePin {
            message_id: message_id.into(),
        })
    }

    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use parley_shared::crypto;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Open(PeerId, bool),
        Signal(PeerId),
        Send(PeerId, Vec<u8>),
        Close(PeerId),
    }

    #[derive(Clone, Default)]
    struct RecordingTransport {
        calls: Arc<Mutex<Vec<Call>>>,
        refuse: Arc<Mutex<HashSet<PeerId>>>,
    }

    impl PeerTransport for RecordingTransport {
        fn open(&mut self, peer_id: &PeerId, initiator: bool) {
            self.calls.lock().unwrap().push(Call::Open(peer_id.clone(), initiator));
        }

        fn accept_signal(&mut self, peer_id: &PeerId, _signal: serde_json::Value) {
            self.calls.lock().unwrap().push(Call::Signal(peer_id.clone()));
        }

        fn send(&mut self, peer_id: &PeerId, data: &[u8]) -> bool {
            if self.refuse.lock().unwrap().contains(peer_id) {
                return false;
            }
            self.calls
                .lock()
                .unwrap()
                .push(Call::Send(peer_id.clone(), data.to_vec()));
            true
        }

        fn close(&mut self, peer_id: &PeerId) {
            self.calls.lock().unwrap().push(Call::Close(peer_id.clone()));
        }
    }

    impl RecordingTransport {
        /// Remove and return everything sent to `peer` so far.
        fn take_sent_to(&self, peer: &str) -> Vec<Vec<u8>> {
            let mut calls = self.calls.lock().unwrap();
            let mut taken = Vec::new();
            calls.retain(|call| match call {
                Call::Send(to, data) if to.as_str() == peer => {
                    taken.push(data.clone());
                    false
                }
                _ => true,
            });
            taken
        }

        fn has(&self, call: &Call) -> bool {
            self.calls.lock().unwrap().contains(call)
        }
    }

    struct Node {
        session: SessionCoordinator<RecordingTransport>,
        transport: RecordingTransport,
        signaling: mpsc::Receiver<ClientMessage>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        inbox: mpsc::UnboundedReceiver<SessionInput>,
    }

    impl Node {
        fn drain_events(&mut self) -> Vec<SessionEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn drain_signaling(&mut self) -> Vec<ClientMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.signaling.try_recv() {
                out.push(message);
            }
            out
        }

        async fn feed(&mut self, message: ServerMessage) {
            self.session.handle_input(SessionInput::Signaling(message)).await;
        }
    }

    fn node_with(name: &str, config: ClientConfig) -> Node {
        let transport = RecordingTransport::default();
        let (signaling_tx, signaling) = mpsc::channel(64);
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let session = SessionCoordinator::new(
            config,
            name,
            transport.clone(),
            SessionLinks {
                signaling: signaling_tx,
                inbox: inbox_tx,
                events: events_tx,
            },
        )
        .unwrap();
        Node {
            session,
            transport,
            signaling,
            events,
            inbox,
        }
    }

    fn node(name: &str) -> Node {
        node_with(name, ClientConfig::default())
    }

    fn member(id: &str) -> Member {
        Member {
            user_id: id.into(),
            username: id.into(),
        }
    }

    /// Hand every envelope `from` sent to `to_id` over to `to`.
    async fn deliver(from: &Node, from_id: &str, to: &mut Node, to_id: &str) -> usize {
        let sent = from.transport.take_sent_to(to_id);
        let count = sent.len();
        for data in sent {
            to.session
                .handle_input(SessionInput::PeerData {
                    peer_id: from_id.into(),
                    data,
                })
                .await;
        }
        count
    }

    async fn joined_alone(name: &str, config: ClientConfig) -> Node {
        let mut a = node_with(name, config);
        a.session.join_room("general".into()).await.unwrap();
        a.feed(ServerMessage::RoomJoined {
            room_id: "general".into(),
            user_id: name.into(),
            users: vec![],
        })
        .await;
        a
    }

    /// A and B in "general" with an established channel both ways.
    async fn connected_pair(config: ClientConfig) -> (Node, Node) {
        let mut a = joined_alone("A", config.clone()).await;
        let mut b = node_with("B", config);
        b.session.join_room("general".into()).await.unwrap();
        b.feed(ServerMessage::RoomJoined {
            room_id: "general".into(),
            user_id: "B".into(),
            users: vec![member("A")],
        })
        .await;
        a.feed(ServerMessage::UserJoined {
            user_id: "B".into(),
            username: "B".into(),
        })
        .await;

        assert!(b.transport.has(&Call::Open("A".into(), true)));
        assert!(a.transport.has(&Call::Open("B".into(), false)));

        a.session.handle_input(SessionInput::LinkOpen("B".into())).await;
        b.session.handle_input(SessionInput::LinkOpen("A".into())).await;
        deliver(&a, "A", &mut b, "B").await;
        deliver(&b, "B", &mut a, "A").await;

        assert_eq!(a.session.channel_state(&"B".into()), Some(ChannelState::Established));
        assert_eq!(b.session.channel_state(&"A".into()), Some(ChannelState::Established));
        a.drain_events();
        b.drain_events();
        (a, b)
    }

    fn small_chunks() -> ClientConfig {
        ClientConfig {
            chunk_size: 10,
            ..ClientConfig::default()
        }
    }

    fn chunk_envelopes(sent: &[Vec<u8>]) -> usize {
        sent.iter()
            .filter(|data| {
                matches!(
                    PeerEnvelope::from_bytes(data),
                    Ok(PeerEnvelope::EncryptedFileChunk { .. })
                )
            })
            .count()
    }

    #[tokio::test]
    async fn test_hello_arrives_with_sender_id_and_timestamp() {
        let (mut a, mut b) = connected_pair(ClientConfig::default()).await;

        let summary = a.session.send_text("hello").unwrap();
        assert_eq!(summary.peers, 1);
        deliver(&a, "A", &mut b, "B").await;

        let message = b.session.messages().get(&summary.id).unwrap();
        assert_eq!(message.sender, "A");
        assert_eq!(message.body, "hello");
        assert_eq!(message.id, format!("A-{}", message.timestamp));
        assert!(a.session.messages().get(&summary.id).is_some());
        assert_eq!(a.session.stats().messages_sent, 1);
        assert!(b
            .drain_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::MessageAdded(m) if m.body == "hello")));
    }

    #[tokio::test]
    async fn test_missing_message_id_falls_back_to_sender_and_timestamp() {
        let (mut a, mut b) = connected_pair(ClientConfig::default()).await;
        a.session.send_text("hi").unwrap();

        for data in a.transport.take_sent_to("B") {
            let stripped = match PeerEnvelope::from_bytes(&data).unwrap() {
                PeerEnvelope::EncryptedMessage { data, timestamp, .. } => PeerEnvelope::EncryptedMessage {
                    data,
                    message_id: None,
                    timestamp,
                },
                other => other,
            };
            b.session
                .handle_input(SessionInput::PeerData {
                    peer_id: "A".into(),
                    data: stripped.to_bytes().unwrap(),
                })
                .await;
        }

        let message = b.session.messages().iter().next().unwrap();
        assert_eq!(message.id, format!("A-{}", message.timestamp));
    }

    #[tokio::test]
    async fn test_40000_byte_file_in_three_chunks_verified() {
        let (mut a, mut b) = connected_pair(ClientConfig::default()).await;
        let data: Vec<u8> = (0..40_000).map(|i| (i % 256) as u8).collect();

        let summary = a
            .session
            .send_file(OutgoingFile::from_bytes("notes.bin", data.clone()))
            .await
            .unwrap();
        assert_eq!(summary.peers, 1);
        while a.session.has_outgoing() {
            a.session.pump_outgoing().await;
        }

        let sent = a.transport.take_sent_to("B");
        assert_eq!(sent.len(), 4);
        assert_eq!(chunk_envelopes(&sent), 3);

        for data in sent {
            b.session
                .handle_input(SessionInput::PeerData {
                    peer_id: "A".into(),
                    data,
                })
                .await;
        }

        let received = b
            .drain_events()
            .into_iter()
            .find_map(|e| match e {
                SessionEvent::FileReceived { peer_id, file } => Some((peer_id, file)),
                _ => None,
            })
            .expect("file received");
        assert_eq!(received.0.as_str(), "A");
        assert!(received.1.verified);
        assert_eq!(received.1.file_id, summary.id);
        assert_eq!(received.1.data.unwrap().as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_user_left_mid_transfer_stops_sends() {
        let (mut a, _b) = connected_pair(small_chunks()).await;

        a.session
            .send_file(OutgoingFile::from_bytes("x", vec![7u8; 30]))
            .await
            .unwrap();
        a.session.pump_outgoing().await;
        assert_eq!(chunk_envelopes(&a.transport.take_sent_to("B")), 1);

        a.feed(ServerMessage::UserLeft {
            user_id: "B".into(),
            username: "B".into(),
        })
        .await;

        assert!(!a.session.has_outgoing());
        a.session.pump_outgoing().await;
        assert!(a.transport.take_sent_to("B").is_empty());
        assert!(a.transport.has(&Call::Close("B".into())));
        assert!(a.session.peer_ids().is_empty());
    }

    #[tokio::test]
    async fn test_room_switch_clears_state_before_join() {
        let (mut a, _b) = connected_pair(small_chunks()).await;
        a.session.send_text("before").unwrap();
        a.session
            .send_file(OutgoingFile::from_bytes("x", vec![1u8; 50]))
            .await
            .unwrap();
        a.session.pump_outgoing().await;
        a.drain_signaling();

        a.session.join_room("gaming".into()).await.unwrap();

        assert_eq!(
            a.drain_signaling(),
            vec![
                ClientMessage::Leave,
                ClientMessage::Join {
                    username: "A".into(),
                    room_id: "gaming".into(),
                },
            ]
        );
        assert!(a.session.peer_ids().is_empty());
        assert!(a.session.messages().is_empty());
        assert!(!a.session.has_outgoing());
        assert_eq!(a.session.stats(), SessionStats::default());
        assert!(a.session.self_id().is_none());
        assert!(a.transport.has(&Call::Close("B".into())));

        // Leftovers from the old room are ignored until the new room confirms.
        a.feed(ServerMessage::UserJoined {
            user_id: "C".into(),
            username: "C".into(),
        })
        .await;
        a.feed(ServerMessage::RoomJoined {
            room_id: "general".into(),
            user_id: "A2".into(),
            users: vec![member("B")],
        })
        .await;
        assert!(a.session.peer_ids().is_empty());

        a.feed(ServerMessage::RoomJoined {
            room_id: "gaming".into(),
            user_id: "A3".into(),
            users: vec![member("D")],
        })
        .await;
        assert_eq!(a.session.room_id().map(|r| r.as_str()), Some("gaming"));
        assert_eq!(a.session.peer_ids(), vec![PeerId::from("D")]);
    }

    #[tokio::test]
    async fn test_room_switch_without_relay_still_clears_state() {
        let (mut a, _b) = connected_pair(small_chunks()).await;
        a.session.send_text("before").unwrap();
        a.session
            .send_file(OutgoingFile::from_bytes("x", vec![1u8; 50]))
            .await
            .unwrap();

        a.signaling.close();
        while a.signaling.try_recv().is_ok() {}

        assert!(matches!(
            a.session.join_room("gaming".into()).await,
            Err(SessionError::SignalingClosed)
        ));
        assert!(a.session.peer_ids().is_empty());
        assert!(a.session.messages().is_empty());
        assert!(!a.session.has_outgoing());
        assert!(a.session.room_id().is_none());
        assert!(a.transport.has(&Call::Close("B".into())));
    }

    #[tokio::test]
    async fn test_duplicate_reaction_counts_once() {
        let (mut a, mut b) = connected_pair(ClientConfig::default()).await;
        let summary = a.session.send_text("react to me").unwrap();
        deliver(&a, "A", &mut b, "B").await;

        assert_eq!(b.session.react(&summary.id, "🔥").unwrap(), 1);
        assert_eq!(b.session.react(&summary.id, "🔥").unwrap(), 0);

        let sent = b.transport.take_sent_to("A");
        assert_eq!(sent.len(), 1);
        // Delivered twice anyway.
        for _ in 0..2 {
            a.session
                .handle_input(SessionInput::PeerData {
                    peer_id: "B".into(),
                    data: sent[0].clone(),
                })
                .await;
        }

        let reaction = &a.session.messages().get(&summary.id).unwrap().reactions[0];
        assert_eq!(reaction.emoji, "🔥");
        assert_eq!(reaction.count, 1);
        assert_eq!(reaction.users, vec!["B"]);
        assert!(matches!(
            b.session.react("nope", "🔥"),
            Err(SessionError::UnknownMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_decrypt_failure_keeps_channel() {
        let (mut a, mut b) = connected_pair(ClientConfig::default()).await;

        let bogus = PeerEnvelope::EncryptedMessage {
            data: crypto::to_base64(&[0u8; 64]),
            message_id: Some("A-1".into()),
            timestamp: 1,
        };
        b.session
            .handle_input(SessionInput::PeerData {
                peer_id: "A".into(),
                data: bogus.to_bytes().unwrap(),
            })
            .await;

        assert_eq!(b.session.stats().decrypt_failures, 1);
        assert!(b.session.messages().is_empty());
        assert!(b.drain_events().iter().any(|e| matches!(
            e,
            SessionEvent::Notice {
                level: crate::events::NoticeLevel::Error,
                ..
            }
        )));
        assert_eq!(b.session.channel_state(&"A".into()), Some(ChannelState::Established));

        a.session.send_text("still here").unwrap();
        deliver(&a, "A", &mut b, "B").await;
        assert_eq!(b.session.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_display_name_relabels_existing_messages() {
        let (mut a, mut b) = connected_pair(ClientConfig::default()).await;
        let summary = a.session.send_text("hi").unwrap();
        deliver(&a, "A", &mut b, "B").await;
        b.drain_events();

        let rename = PeerEnvelope::DisplayNameShare {
            name: "Alice".into(),
        };
        for _ in 0..2 {
            b.session
                .handle_input(SessionInput::PeerData {
                    peer_id: "A".into(),
                    data: rename.to_bytes().unwrap(),
                })
                .await;
        }

        assert_eq!(b.session.messages().get(&summary.id).unwrap().sender, "Alice");
        assert_eq!(b.session.peer_name(&"A".into()), Some("Alice"));
        let updates = b
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::MessageUpdated { .. }))
            .count();
        assert_eq!(updates, 1);
        assert!(b
            .session
            .members()
            .iter()
            .any(|m| m.user_id.as_str() == "A" && m.username == "Alice"));
    }

    #[tokio::test]
    async fn test_send_requires_room_and_peers() {
        let mut lone = node("A");
        assert!(matches!(lone.session.send_text("x"), Err(SessionError::NotJoined)));

        let mut a = joined_alone("A", ClientConfig::default()).await;
        assert!(matches!(a.session.send_text("x"), Err(SessionError::NoPeers)));
        assert!(matches!(
            a.session
                .send_file(OutgoingFile::from_bytes("f", vec![1u8]))
                .await,
            Err(SessionError::NoPeers)
        ));
    }

    #[tokio::test]
    async fn test_member_list_heals_peer_map() {
        let mut a = joined_alone("A", ClientConfig::default()).await;

        a.feed(ServerMessage::UserList {
            users: vec![member("A"), member("C")],
        })
        .await;
        assert_eq!(a.session.peer_ids(), vec![PeerId::from("C")]);
        assert!(a.transport.has(&Call::Open("C".into(), false)));

        a.feed(ServerMessage::UserList {
            users: vec![member("A")],
        })
        .await;
        assert!(a.session.peer_ids().is_empty());
        assert!(a.transport.has(&Call::Close("C".into())));
    }

    #[tokio::test]
    async fn test_signal_forwarded_only_for_known_peers() {
        let mut a = joined_alone("A", ClientConfig::default()).await;
        a.feed(ServerMessage::UserJoined {
            user_id: "B".into(),
            username: "B".into(),
        })
        .await;

        a.feed(ServerMessage::Signal {
            from_id: "B".into(),
            signal: serde_json::json!({ "sdp": "offer" }),
        })
        .await;
        a.feed(ServerMessage::Signal {
            from_id: "Z".into(),
            signal: serde_json::json!({}),
        })
        .await;

        assert!(a.transport.has(&Call::Signal("B".into())));
        assert!(!a.transport.has(&Call::Signal("Z".into())));
    }

    #[tokio::test]
    async fn test_link_closed_drops_transfers_keeps_channel() {
        let (mut a, _b) = connected_pair(small_chunks()).await;
        a.session
            .send_file(OutgoingFile::from_bytes("x", vec![3u8; 40]))
            .await
            .unwrap();
        a.session.pump_outgoing().await;

        a.session.handle_input(SessionInput::LinkClosed("B".into())).await;

        assert!(!a.session.has_outgoing());
        assert_eq!(a.session.channel_state(&"B".into()), Some(ChannelState::Established));
        assert_eq!(a.session.peer_ids(), vec![PeerId::from("B")]);
    }

    #[tokio::test]
    async fn test_refused_send_aborts_transfer() {
        let (mut a, _b) = connected_pair(small_chunks()).await;
        a.session
            .send_file(OutgoingFile::from_bytes("x", vec![9u8; 40]))
            .await
            .unwrap();
        a.transport.refuse.lock().unwrap().insert("B".into());

        a.session.pump_outgoing().await;

        assert!(!a.session.has_outgoing());
        assert!(a.drain_events().iter().any(|e| matches!(
            e,
            SessionEvent::Notice { text, .. } if text.starts_with("Stopped sending x")
        )));
    }

    #[tokio::test]
    async fn test_zero_byte_file_reaches_peer() {
        let (mut a, mut b) = connected_pair(ClientConfig::default()).await;
        a.session
            .send_file(OutgoingFile::from_bytes("empty", Vec::new()))
            .await
            .unwrap();
        assert!(!a.session.has_outgoing());
        assert_eq!(deliver(&a, "A", &mut b, "B").await, 1);

        assert!(b.drain_events().iter().any(|e| matches!(
            e,
            SessionEvent::FileReceived { file, .. } if file.verified && file.file_size == 0
        )));
    }

    #[tokio::test]
    async fn test_pin_and_delete_stay_local() {
        let (mut a, _b) = connected_pair(ClientConfig::default()).await;
        let summary = a.session.send_text("keep").unwrap();
        a.transport.take_sent_to("B");

        assert_eq!(a.session.toggle_pin(&summary.id), Some(true));
        assert_eq!(a.session.messages().pinned().len(), 1);
        assert!(a.session.delete_message(&summary.id));
        assert!(a.transport.take_sent_to("B").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_name_announcements_repeat() {
        let (mut a, _b) = connected_pair(ClientConfig::default()).await;
        a.transport.take_sent_to("B");

        tokio::time::sleep(std::time::Duration::from_millis(1_000)).await;
        let mut announced = 0;
        while let Ok(input) = a.inbox.try_recv() {
            a.session.handle_input(input).await;
            announced += 1;
        }
        assert_eq!(announced, 3);
        assert_eq!(a.transport.take_sent_to("B").len(), 3);
    }

    #[tokio::test]
    async fn test_run_loop_via_handle() {
        let transport = RecordingTransport::default();
        let (signaling_tx, mut signaling) = mpsc::channel(8);
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let session = SessionCoordinator::new(
            ClientConfig::default(),
            "A",
            transport,
            SessionLinks {
                signaling: signaling_tx,
                inbox: inbox_tx.clone(),
                events: events_tx,
            },
        )
        .unwrap();
        let handle = session.handle();
        let task = tokio::spawn(session.run(inbox));

        handle.join_room("general").unwrap();
        assert!(matches!(
            signaling.recv().await,
            Some(ClientMessage::Join { .. })
        ));
        inbox_tx
            .send(SessionInput::Signaling(ServerMessage::RoomJoined {
                room_id: "general".into(),
                user_id: "A".into(),
                users: vec![],
            }))
            .unwrap();

        assert!(matches!(
            handle.send_text("anyone?").await,
            Err(SessionError::NoPeers)
        ));

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert_eq!(signaling.recv().await, Some(ClientMessage::Leave));
        assert!(matches!(
            handle.send_text("late").await,
            Err(SessionError::SessionClosed)
        ));
    }
}
