use serde::Serialize;

use parley_shared::types::{Member, PeerId, RoomId};

use crate::messages::Message;
use crate::transfer::{ReceivedFile, TransferProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Everything a front end needs to render the room, in the order the
/// session loop produced it.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    RoomJoined {
        room_id: RoomId,
        self_id: PeerId,
        members: Vec<Member>,
    },
    /// Current roster, names preferring the last announcement.
    RosterChanged { members: Vec<Member> },
    PeerJoined { peer_id: PeerId, username: String },
    PeerLeft { peer_id: PeerId, username: String },
    /// Shared key derived; messages and files to this peer are possible.
    ChannelReady { peer_id: PeerId },
    MessageAdded(Message),
    /// Reactions, sender label or pin state changed.
    MessageUpdated { message_id: String },
    MessageDeleted { message_id: String },
    TransferProgress {
        peer_id: PeerId,
        progress: TransferProgress,
    },
    FileReceived { peer_id: PeerId, file: ReceivedFile },
    Notice { level: NoticeLevel, text: String },
}

impl SessionEvent {
    pub fn info(text: impl Into<String>) -> Self {
        SessionEvent::Notice {
            level: NoticeLevel::Info,
            text: text.into(),
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        SessionEvent::Notice {
            level: NoticeLevel::Warning,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        SessionEvent::Notice {
            level: NoticeLevel::Error,
            text: text.into(),
        }
    }
}
