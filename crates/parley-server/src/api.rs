use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use parley_shared::protocol::{ClientMessage, ServerMessage};

use crate::config::ServerConfig;
use crate::relay::{check_join, Membership, Outbox, Relay};

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    rooms: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        rooms: state.relay.room_count().await,
    })
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(state.config.max_envelope_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// One signaling session per WebSocket. Closing the socket is an implicit
/// `leave`.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.config.session_queue_depth);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode server envelope");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    debug!("Signaling connection opened");
    let mut membership: Option<Membership> = None;

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "WebSocket read failed");
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                handle_envelope(&state.relay, &tx, &mut membership, &text).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(current) = membership.take() {
        state.relay.leave(current).await;
    }
    writer.abort();
    debug!("Signaling connection closed");
}

async fn handle_envelope(
    relay: &Relay,
    outbox: &Outbox,
    membership: &mut Option<Membership>,
    text: &str,
) {
    let message = match ClientMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Dropping malformed signaling envelope");
            return;
        }
    };

    match message {
        ClientMessage::Join { username, room_id } => {
            // A rejected join leaves the current seat alone.
            if let Err(e) = check_join(&username, &room_id) {
                warn!(error = %e, "Join rejected");
                return;
            }
            // A session sits in at most one room.
            if let Some(previous) = membership.take() {
                relay.leave(previous).await;
            }
            match relay.join(&username, &room_id, outbox.clone()).await {
                Ok(joined) => *membership = Some(joined),
                Err(e) => warn!(error = %e, "Join rejected"),
            }
        }
        ClientMessage::Signal { target_id, signal } => match membership.as_ref() {
            Some(current) => relay.relay_envelope(current, &target_id, signal).await,
            None => debug!("Signal before join dropped"),
        },
        ClientMessage::Leave => {
            if let Some(current) = membership.take() {
                relay.leave(current).await;
            }
        }
    }
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting signaling server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    use parley_shared::types::SessionId;

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    fn test_state() -> AppState {
        AppState {
            relay: Relay::new(),
            config: Arc::new(ServerConfig::default()),
        }
    }

    async fn spawn_server(state: AppState) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        addr
    }

    async fn connect(addr: std::net::SocketAddr) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        client
    }

    async fn send(client: &mut Client, message: ClientMessage) {
        client
            .send(WsMessage::Text(message.to_json().unwrap()))
            .await
            .unwrap();
    }

    async fn recv(client: &mut Client) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for envelope")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    async fn join(client: &mut Client, name: &str, room: &str) -> SessionId {
        send(
            client,
            ClientMessage::Join {
                username: name.into(),
                room_id: room.into(),
            },
        )
        .await;
        loop {
            if let ServerMessage::RoomJoined { user_id, .. } = recv(client).await {
                return user_id;
            }
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_signal_between_two_sockets() {
        let addr = spawn_server(test_state()).await;
        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;

        let alice_id = join(&mut alice, "alice", "general").await;
        let bob_id = join(&mut bob, "bob", "general").await;

        send(
            &mut bob,
            ClientMessage::Signal {
                target_id: alice_id.clone(),
                signal: json!({ "candidate": "c1" }),
            },
        )
        .await;

        loop {
            match recv(&mut alice).await {
                ServerMessage::Signal { from_id, signal } => {
                    assert_eq!(from_id, bob_id);
                    assert_eq!(signal, json!({ "candidate": "c1" }));
                    break;
                }
                ServerMessage::UserJoined { user_id, .. } => assert_eq!(user_id, bob_id),
                ServerMessage::UserList { .. } => {}
                other => panic!("unexpected envelope {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_socket_close_is_leave() {
        let state = test_state();
        let relay = state.relay.clone();
        let addr = spawn_server(state).await;

        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        join(&mut alice, "alice", "general").await;
        let bob_id = join(&mut bob, "bob", "general").await;

        bob.close(None).await.unwrap();

        loop {
            if let ServerMessage::UserLeft { user_id, username } = recv(&mut alice).await {
                assert_eq!(user_id, bob_id);
                assert_eq!(username, "bob");
                break;
            }
        }
        assert_eq!(relay.members(&"general".into()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_garbage_does_not_close_session() {
        let addr = spawn_server(test_state()).await;
        let mut alice = connect(addr).await;

        alice
            .send(WsMessage::Text("{not json".into()))
            .await
            .unwrap();
        alice
            .send(WsMessage::Text(r#"{"type":"dance"}"#.into()))
            .await
            .unwrap();

        join(&mut alice, "alice", "general").await;
    }

    #[tokio::test]
    async fn test_malformed_rejoin_keeps_room() {
        let state = test_state();
        let relay = state.relay.clone();
        let addr = spawn_server(state).await;
        let mut alice = connect(addr).await;

        let alice_id = join(&mut alice, "alice", "general").await;
        alice
            .send(WsMessage::Text(
                r#"{"type":"join","username":"  ","roomId":"gaming"}"#.into(),
            ))
            .await
            .unwrap();

        // Still seated: a signal to ourselves comes back through the room.
        send(
            &mut alice,
            ClientMessage::Signal {
                target_id: alice_id.clone(),
                signal: json!("ping"),
            },
        )
        .await;
        loop {
            if let ServerMessage::Signal { from_id, .. } = recv(&mut alice).await {
                assert_eq!(from_id, alice_id);
                break;
            }
        }

        assert_eq!(relay.members(&"general".into()).await.len(), 1);
        assert!(relay.members(&"gaming".into()).await.is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_moves_session() {
        let state = test_state();
        let relay = state.relay.clone();
        let addr = spawn_server(state).await;
        let mut alice = connect(addr).await;

        join(&mut alice, "alice", "general").await;
        join(&mut alice, "alice", "gaming").await;

        assert!(relay.members(&"general".into()).await.is_empty());
        assert_eq!(relay.members(&"gaming".into()).await.len(), 1);
    }
}
