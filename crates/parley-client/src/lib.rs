//! Peer side of Parley: per-peer secure channels, chunked file transfer and
//! the session loop that ties them to the signaling relay.
//!
//! A typical embedding:
//!
//! ```no_run
//! # async fn demo<T: parley_client::PeerTransport + 'static>(transport: T) -> Result<(), parley_client::SessionError> {
//! use parley_client::{signaling, ClientConfig, SessionCoordinator, SessionLinks};
//! use tokio::sync::mpsc;
//!
//! let config = ClientConfig::from_env();
//! let (signaling_tx, relay_rx) = signaling::connect(&config.signaling_url).await?;
//! let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
//! let (events_tx, mut events) = mpsc::unbounded_channel();
//! signaling::bridge(relay_rx, inbox_tx.clone());
//!
//! let session = SessionCoordinator::new(
//!     config,
//!     "alice",
//!     transport,
//!     SessionLinks { signaling: signaling_tx, inbox: inbox_tx, events: events_tx },
//! )?;
//! let handle = session.handle();
//! tokio::spawn(session.run(inbox_rx));
//!
//! handle.join_room("general")?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod messages;
pub mod retry;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod transport;

pub use channel::{ChannelState, SecureChannel};
pub use config::ClientConfig;
pub use error::{ChannelError, SessionError, TransferError};
pub use events::{NoticeLevel, SessionEvent};
pub use messages::{Message, MessageLog, Reaction};
pub use session::{SendSummary, SessionCoordinator, SessionHandle, SessionInput, SessionLinks};
pub use transfer::{FileTransferEngine, OutgoingFile, ReceivedFile, TransferProgress};
pub use transport::PeerTransport;
