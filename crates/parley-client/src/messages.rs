//! In-memory message list for the current room.
//!
//! Messages carry the id their sender chose, so a reaction that names an
//! id resolves to the same message on every participant. Deletion and
//! pinning are local only and never propagate.

use serde::Serialize;

use parley_shared::types::PeerId;

/// Running tally for one emoji on one message.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Reaction {
    pub emoji: String,
    /// Number of distinct contributors.
    pub count: u32,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Message {
    /// `"{senderId}-{unixMillis}"`, assigned by the sender.
    pub id: String,
    /// Sender's display name as last announced.
    pub sender: String,
    pub sender_id: PeerId,
    pub body: String,
    /// Sender clock, unix milliseconds.
    pub timestamp: i64,
    pub reactions: Vec<Reaction>,
    pub pinned: bool,
}

impl Message {
    pub fn new(id: String, sender: String, sender_id: PeerId, body: String, timestamp: i64) -> Self {
        Self {
            id,
            sender,
            sender_id,
            body,
            timestamp,
            reactions: Vec::new(),
            pinned: false,
        }
    }
}

/// Result of applying one reaction contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    Applied,
    /// This name already contributed this emoji; nothing changed.
    Duplicate,
    UnknownMessage,
}

/// Build the id a sender stamps on an outgoing message.
///
/// Two sends by the same participant within one millisecond produce the
/// same id; receivers keep both messages and reactions land on the first.
pub fn message_id(sender_id: &PeerId, timestamp_ms: i64) -> String {
    format!("{sender_id}-{timestamp_ms}")
}

#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn apply_reaction(&mut self, id: &str, emoji: &str, username: &str) -> ReactionOutcome {
        let Some(message) = self.messages.iter_mut().find(|m| m.id == id) else {
            return ReactionOutcome::UnknownMessage;
        };

        match message.reactions.iter_mut().find(|r| r.emoji == emoji) {
            Some(reaction) => {
                if reaction.users.iter().any(|u| u == username) {
                    return ReactionOutcome::Duplicate;
                }
                reaction.users.push(username.to_string());
                reaction.count += 1;
            }
            None => message.reactions.push(Reaction {
                emoji: emoji.to_string(),
                count: 1,
                users: vec![username.to_string()],
            }),
        }
        ReactionOutcome::Applied
    }

    /// Rewrite the sender name on every message from `sender_id`.
    /// Returns the ids that changed.
    pub fn relabel_sender(&mut self, sender_id: &PeerId, name: &str) -> Vec<String> {
        let mut changed = Vec::new();
        for message in self
            .messages
            .iter_mut()
            .filter(|m| &m.sender_id == sender_id && m.sender != name)
        {
            message.sender = name.to_string();
            changed.push(message.id.clone());
        }
        changed
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        self.messages.len() != before
    }

    /// Flip the pin flag, returning the new value.
    pub fn toggle_pin(&mut self, id: &str) -> Option<bool> {
        let message = self.messages.iter_mut().find(|m| m.id == id)?;
        message.pinned = !message.pinned;
        Some(message.pinned)
    }

    pub fn pinned(&self) -> Vec<&Message> {
        self.messages.iter().filter(|m| m.pinned).collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
