//! WebSocket connection to the signaling relay.
//!
//! [`connect`] splits the socket into a writer task fed by an
//! `mpsc::Sender<ClientMessage>` and a reader task that decodes relay
//! envelopes into an `mpsc::Receiver<ServerMessage>`. Frames that do not
//! decode are logged and skipped. The receiver yields `None` once the
//! socket is gone.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use parley_shared::protocol::{ClientMessage, ServerMessage};

use crate::error::SessionError;
use crate::session::SessionInput;

const QUEUE_DEPTH: usize = 64;

pub async fn connect(
    url: &str,
) -> Result<(mpsc::Sender<ClientMessage>, mpsc::Receiver<ServerMessage>), SessionError> {
    let (socket, _) = connect_async(url).await?;
    info!(url = %url, "Connected to signaling relay");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(QUEUE_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<ServerMessage>(QUEUE_DEPTH);

    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode signaling envelope");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                warn!(error = %e, "Signaling write failed");
                break;
            }
        }
        let _ = sink.close().await;
        debug!("Signaling writer stopped");
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "Signaling read failed");
                    break;
                }
            };
            match ServerMessage::from_json(&text) {
                Ok(message) => {
                    if in_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Dropping malformed relay envelope"),
            }
        }
        info!("Signaling connection closed");
    });

    Ok((out_tx, in_rx))
}

/// Forward relay envelopes into a session inbox, then report the close.
pub fn bridge(
    mut relay: mpsc::Receiver<ServerMessage>,
    inbox: mpsc::UnboundedSender<SessionInput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = relay.recv().await {
            if inbox.send(SessionInput::Signaling(message)).is_err() {
                return;
            }
        }
        let _ = inbox.send(SessionInput::SignalingClosed);
    })
}
