use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::app_state::AppState;
use crate::config::ServerConfig;
use crate::error::{Result, SignalError};
use crate::protocol::{ClientMessage, ServerMessage, SignalKind};
use crate::room::{Connection, ParticipantId, RoomId};
use crate::signal::PresenceUpdate;

/// HTTP surface: the signaling socket plus the static browser client.
pub fn routes(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route(&config.ws_path, get(ws_handler))
        .fallback_service(ServeDir::new(&config.static_dir))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn = Connection::new(tx);
    let participant = conn.id;
    tracing::info!(participant = %participant.short(), "client connected");

    conn.send(ServerMessage::Connected {
        participant_id: participant,
    });

    // Outbound frames from the channel to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("failed to encode server message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames, handled one at a time in arrival order
    let recv_state = state.clone();
    let recv_conn = conn.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => handle_frame(&recv_state, &recv_conn, &text).await,
                Ok(Message::Binary(_)) => {
                    tracing::warn!(participant = %recv_conn.id.short(), "binary frame ignored");
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(participant = %recv_conn.id.short(), "receive error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        // a registry call must not be cancelled halfway, let the reader finish
        _ = &mut send_task => {
            let _ = recv_task.await;
        }
    }

    state.registry.on_disconnect(&participant).await;
    tracing::info!(participant = %participant.short(), "client disconnected");
}

async fn handle_frame(state: &AppState, conn: &Connection, text: &str) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(participant = %conn.id.short(), "malformed frame: {}", e);
            conn.send(ServerMessage::error(&SignalError::InvalidMessage(
                e.to_string(),
            )));
            return;
        }
    };

    if let Err(err) = dispatch(state, conn, msg).await {
        tracing::debug!(participant = %conn.id.short(), code = err.code(), "request failed: {}", err);
        conn.send(ServerMessage::error(&err));
    }
}

/// Apply one client request on behalf of `conn`.
///
/// Negotiation relays that cannot be delivered are logged and dropped, never
/// reported back. Every other failure is returned for an `error` frame.
pub async fn dispatch(state: &AppState, conn: &Connection, msg: ClientMessage) -> Result<()> {
    match msg {
        ClientMessage::CreateRoom { display_name } => {
            state
                .registry
                .create_room(conn, &display_name_or_default(&display_name))
                .await;
        }
        ClientMessage::JoinRoom {
            room_id,
            display_name,
        } => {
            state
                .registry
                .join_room(conn, &room_id, &display_name_or_default(&display_name))
                .await?;
        }
        ClientMessage::LeaveRoom { room_id } => {
            ensure_current_room(state, conn, &room_id).await?;
            state.registry.leave_room(&conn.id).await;
        }
        ClientMessage::EndCall { room_id } => {
            state.registry.end_room(&conn.id, &room_id).await?;
        }
        ClientMessage::Offer { to, payload } => {
            relay(state, conn, SignalKind::Offer, &to, payload).await;
        }
        ClientMessage::Answer { to, payload } => {
            relay(state, conn, SignalKind::Answer, &to, payload).await;
        }
        ClientMessage::Candidate { to, payload } => {
            relay(state, conn, SignalKind::Candidate, &to, payload).await;
        }
        ClientMessage::ChatMessage { room_id, text } => {
            state
                .router
                .broadcast_chat(&conn.id, &room_id, &text)
                .await?;
        }
        ClientMessage::VideoStateChange {
            room_id,
            is_video_off,
        } => {
            state
                .router
                .broadcast_presence(&conn.id, &room_id, PresenceUpdate::Video { is_video_off })
                .await?;
        }
        ClientMessage::SpeakingStateChange { room_id, speaking } => {
            state
                .router
                .broadcast_presence(&conn.id, &room_id, PresenceUpdate::Speaking { speaking })
                .await?;
        }
    }
    Ok(())
}

async fn relay(
    state: &AppState,
    conn: &Connection,
    kind: SignalKind,
    to: &ParticipantId,
    payload: Value,
) {
    if let Err(err) = state.router.relay(kind, &conn.id, to, payload).await {
        tracing::debug!(
            from = %conn.id.short(),
            kind = kind.as_str(),
            "relay dropped: {}",
            err
        );
    }
}

/// Leaving while in no room is fine; leaving a room one is not in is not.
async fn ensure_current_room(state: &AppState, conn: &Connection, room_id: &RoomId) -> Result<()> {
    match state.registry.room_of(&conn.id).await {
        Some(current) if current != *room_id => {
            Err(SignalError::NotAuthorized("not a member of this room"))
        }
        _ => Ok(()),
    }
}

fn display_name_or_default(raw: &str) -> String {
    let name = raw.trim();
    if name.is_empty() {
        "Guest".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connect() -> (Connection, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn created_room(state: &AppState, conn: &Connection) -> RoomId {
        dispatch(
            state,
            conn,
            ClientMessage::CreateRoom {
                display_name: "host".into(),
            },
        )
        .await
        .unwrap();
        state.registry.room_of(&conn.id).await.unwrap()
    }

    #[tokio::test]
    async fn create_and_join_round() {
        let state = AppState::default();
        let (host, mut host_rx) = connect();
        let (guest, mut guest_rx) = connect();

        let room_id = created_room(&state, &host).await;
        dispatch(
            &state,
            &guest,
            ClientMessage::JoinRoom {
                room_id: room_id.clone(),
                display_name: "  ".into(),
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            drain(&mut host_rx).as_slice(),
            [ServerMessage::RoomCreated { .. }, ServerMessage::UserJoined { participant }]
                if participant.display_name == "Guest"
        ));
        assert!(matches!(
            drain(&mut guest_rx).as_slice(),
            [ServerMessage::RoomJoined { is_host: false, .. }]
        ));
    }

    #[tokio::test]
    async fn join_unknown_room_reports_error() {
        let state = AppState::default();
        let (guest, _rx) = connect();

        let err = dispatch(
            &state,
            &guest,
            ClientMessage::JoinRoom {
                room_id: RoomId::from("missing"),
                display_name: "g".into(),
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), "ROOM_NOT_FOUND");
    }

    #[tokio::test]
    async fn undeliverable_relay_is_silent() {
        let state = AppState::default();
        let (host, mut host_rx) = connect();
        created_room(&state, &host).await;
        drain(&mut host_rx);

        let res = dispatch(
            &state,
            &host,
            ClientMessage::Offer {
                to: ParticipantId::new(),
                payload: json!({}),
            },
        )
        .await;

        assert!(res.is_ok());
        assert!(drain(&mut host_rx).is_empty());
    }

    #[tokio::test]
    async fn answer_is_relayed_with_server_stamped_sender() {
        let state = AppState::default();
        let (host, _host_rx) = connect();
        let (guest, mut guest_rx) = connect();
        let room_id = created_room(&state, &host).await;
        state
            .registry
            .join_room(&guest, &room_id, "guest")
            .await
            .unwrap();
        drain(&mut guest_rx);

        dispatch(
            &state,
            &host,
            ClientMessage::Answer {
                to: guest.id,
                payload: json!({"type": "answer"}),
            },
        )
        .await
        .unwrap();

        assert_eq!(
            drain(&mut guest_rx),
            vec![ServerMessage::Answer {
                from: host.id,
                payload: json!({"type": "answer"})
            }]
        );
    }

    #[tokio::test]
    async fn leave_for_other_room_is_refused() {
        let state = AppState::default();
        let (host, _rx) = connect();
        let room_id = created_room(&state, &host).await;

        let err = dispatch(
            &state,
            &host,
            ClientMessage::LeaveRoom {
                room_id: RoomId::from("other"),
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), "NOT_AUTHORIZED");
        assert_eq!(state.registry.room_of(&host.id).await, Some(room_id.clone()));

        dispatch(&state, &host, ClientMessage::LeaveRoom { room_id: room_id.clone() })
            .await
            .unwrap();
        dispatch(&state, &host, ClientMessage::LeaveRoom { room_id })
            .await
            .unwrap();
        assert_eq!(state.registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn frame_decode_failure_sends_error() {
        let state = AppState::default();
        let (conn, mut rx) = connect();

        handle_frame(&state, &conn, "{\"event\":\"joinRoom\"}").await;

        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::Error { code, .. }] if code == "INVALID_MESSAGE"
        ));
    }
}
