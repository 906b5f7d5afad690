//! Seam to the direct-link transport.
//!
//! NAT traversal and the link library itself live outside this crate. An
//! implementation is expected to hold a clone of the signaling sender for
//! its own outbound negotiation payloads (wrapped in
//! [`ClientMessage::Signal`](parley_shared::protocol::ClientMessage)) and
//! to report link events back into the session inbox as
//! [`SessionInput::LinkOpen`](crate::session::SessionInput),
//! [`SessionInput::LinkClosed`](crate::session::SessionInput) and
//! [`SessionInput::PeerData`](crate::session::SessionInput).
//!
//! Delivery per peer must be reliable and in order.

use serde_json::Value;

use parley_shared::types::PeerId;

pub trait PeerTransport: Send {
    /// Begin establishing a direct link. `initiator` selects the side that
    /// makes the first offer; members already in the room are dialed by
    /// the newcomer.
    fn open(&mut self, peer_id: &PeerId, initiator: bool);

    /// Hand over a negotiation payload relayed from `peer_id`.
    fn accept_signal(&mut self, peer_id: &PeerId, signal: Value);

    /// Queue bytes on an open link. `false` means nothing was sent.
    fn send(&mut self, peer_id: &PeerId, data: &[u8]) -> bool;

    /// Tear the link down; no further events are expected for it.
    fn close(&mut self, peer_id: &PeerId);
}
