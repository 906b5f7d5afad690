//! # parley-shared
//!
//! Types shared by the signaling relay and the peer client: identifiers,
//! the JSON wire envelopes for both the signaling channel and the
//! peer-direct channel, and the cryptographic primitives every pairwise
//! link is built on.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, ParleyError, ProtocolError};
pub use types::{Member, PeerId, RoomId, SessionId};
