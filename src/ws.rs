//! WebSocket transport: one connection per client, carrying procedure
//! calls, row-change notifications for the joined session, and peer
//! broadcasts for both screens.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::protocol::{
    ChangeEvent, ClientMessage, JoinOutcome, JoinResult, PeerMessage, PeerScope, ServerMessage,
};
use crate::state::AppState;
use crate::types::{generate_guest_id, SessionId};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Returning customers reconnect with their id; absent means guest
    pub customer_id: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, params: WsQuery, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let customer_id = params.customer_id.unwrap_or_else(generate_guest_id);
    tracing::info!("WebSocket connected: {customer_id}");

    let welcome = ServerMessage::Welcome {
        protocol: "1.0".to_string(),
        customer_id: customer_id.clone(),
        server_now: chrono::Utc::now().to_rfc3339(),
    };
    if let Ok(msg) = serde_json::to_string(&welcome) {
        if sender.send(Message::Text(msg.into())).await.is_err() {
            tracing::error!("Failed to send welcome message");
            return;
        }
    }

    let mut changes_rx = state.subscribe_changes();

    // Populated once the client joins a session
    let mut session_id: Option<SessionId> = None;
    let mut lobby_rx: Option<tokio::sync::broadcast::Receiver<PeerMessage>> = None;
    let mut game_rx: Option<tokio::sync::broadcast::Receiver<PeerMessage>> = None;

    loop {
        tokio::select! {
            change = changes_rx.recv() => {
                match change {
                    Ok(ev) => {
                        if !forward_change(&mut sender, &session_id, ev).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!("Connection {customer_id} lagged {missed} changes");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            peer = recv_opt(&mut lobby_rx) => {
                if let Some(msg) = peer {
                    if !forward_peer(&mut sender, &customer_id, msg).await {
                        break;
                    }
                }
            }

            peer = recv_opt(&mut game_rx) => {
                if let Some(msg) = peer {
                    if !forward_peer(&mut sender, &customer_id, msg).await {
                        break;
                    }
                }
            }

            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Received message: {}", text);

                        let response = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Join { lobby_code, player_name, player_id }) => {
                                let identity = player_id.unwrap_or_else(|| customer_id.clone());
                                match state.join(&lobby_code, &player_name, Some(identity)).await {
                                    Ok(result) => {
                                        subscribe_session(
                                            &state,
                                            &result.session.id,
                                            &mut session_id,
                                            &mut lobby_rx,
                                            &mut game_rx,
                                        )
                                        .await;
                                        Some(ServerMessage::Joined(result))
                                    }
                                    Err(e) => Some(ServerMessage::from(&e)),
                                }
                            }
                            Ok(ClientMessage::CreateLobby { host_name }) => {
                                match state.create_session(&customer_id, &host_name).await {
                                    Ok(session) => {
                                        subscribe_session(
                                            &state,
                                            &session.id,
                                            &mut session_id,
                                            &mut lobby_rx,
                                            &mut game_rx,
                                        )
                                        .await;
                                        match state.find_membership(&session.id, &customer_id).await {
                                            Some(player) => Some(ServerMessage::Joined(JoinResult {
                                                session,
                                                player,
                                                outcome: JoinOutcome::Joined,
                                            })),
                                            None => Some(ServerMessage::Error {
                                                code: "NOT_FOUND".to_string(),
                                                msg: "Host membership missing".to_string(),
                                            }),
                                        }
                                    }
                                    Err(e) => Some(ServerMessage::from(&e)),
                                }
                            }
                            Ok(msg) => handle_message(msg, &customer_id, &state).await,
                            Err(e) => {
                                tracing::error!("Failed to parse client message: {}", e);
                                Some(ServerMessage::Error {
                                    code: "PARSE_ERROR".to_string(),
                                    msg: format!("Invalid message format: {}", e),
                                })
                            }
                        };

                        if let Some(response) = response {
                            if let Ok(json) = serde_json::to_string(&response) {
                                if sender.send(Message::Text(json.into())).await.is_err() {
                                    tracing::error!("Failed to send response");
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("WebSocket closed");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    tracing::info!("WebSocket connection closed: {customer_id}");
}

async fn subscribe_session(
    state: &AppState,
    id: &str,
    session_id: &mut Option<SessionId>,
    lobby_rx: &mut Option<tokio::sync::broadcast::Receiver<PeerMessage>>,
    game_rx: &mut Option<tokio::sync::broadcast::Receiver<PeerMessage>>,
) {
    *session_id = Some(id.to_string());
    *lobby_rx = Some(state.subscribe_peers(id, PeerScope::Lobby).await);
    *game_rx = Some(state.subscribe_peers(id, PeerScope::Game).await);
}

/// Only notifications for the joined session reach the client
async fn forward_change(
    sender: &mut (impl SinkExt<Message> + Unpin),
    session_id: &Option<SessionId>,
    ev: ChangeEvent,
) -> bool {
    if session_id.as_deref() != Some(ev.session_id.as_str()) {
        return true;
    }
    match serde_json::to_string(&ServerMessage::Change(ev)) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}

/// Peer broadcasts fan out to everyone in scope except the sender
async fn forward_peer(
    sender: &mut (impl SinkExt<Message> + Unpin),
    customer_id: &str,
    msg: PeerMessage,
) -> bool {
    if msg.sender_id == customer_id {
        return true;
    }
    match serde_json::to_string(&ServerMessage::Peer(msg)) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}

async fn recv_opt(
    rx: &mut Option<tokio::sync::broadcast::Receiver<PeerMessage>>,
) -> Option<PeerMessage> {
    match rx {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    // Session gone; the change stream delivers the delete
                    std::future::pending::<()>().await;
                }
            }
        },
        // Not joined yet: wait forever
        None => std::future::pending().await,
    }
}

/// Dispatch for everything except the two messages that establish the
/// session subscription. The connection's customer id is the caller for
/// every authorization check.
pub async fn handle_message(
    msg: ClientMessage,
    customer_id: &str,
    state: &Arc<AppState>,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::CreateLobby { .. } | ClientMessage::Join { .. } => None,

        ClientMessage::StartGame { session_id } => {
            Some(reply(state.start_game(&session_id, customer_id).await))
        }

        ClientMessage::UpdateSessionTheme {
            session_id,
            theme_id,
        } => Some(reply(
            state
                .update_session_theme(&session_id, customer_id, &theme_id)
                .await,
        )),

        ClientMessage::StartTurn {
            session_id,
            theme_id,
            turn_mode,
        } => Some(
            match state
                .start_turn(&session_id, customer_id, &theme_id, turn_mode)
                .await
            {
                Ok(result) => ServerMessage::TurnStarted(result),
                Err(e) => ServerMessage::from(&e),
            },
        ),

        ClientMessage::SaveSecretElement {
            session_id,
            icon_id,
        } => Some(reply(
            state
                .save_secret_element(&session_id, customer_id, &icon_id)
                .await
                .map(|_| ()),
        )),

        ClientMessage::CompleteClue { session_id, clue } => Some(reply(
            state.complete_clue(&session_id, customer_id, clue).await,
        )),

        ClientMessage::SubmitGuess {
            session_id,
            round_number,
            guess,
        } => Some(
            match state
                .submit_guess(&session_id, customer_id, round_number, &guess)
                .await
            {
                Ok(result) => ServerMessage::GuessResult(result),
                Err(e) => ServerMessage::from(&e),
            },
        ),

        ClientMessage::AdvanceRound { session_id } => {
            Some(reply(state.advance_round(&session_id).await))
        }

        ClientMessage::SkipTurn { session_id } => Some(
            match state.get_session(&session_id).await {
                Ok(session) if !session.is_host(customer_id) => ServerMessage::Error {
                    code: "UNAUTHORIZED".to_string(),
                    msg: "Only the host can skip a turn".to_string(),
                },
                Ok(_) => match state.skip_turn(&session_id, "skipped by host").await {
                    Ok(_) => ServerMessage::Ok,
                    Err(e) => ServerMessage::from(&e),
                },
                Err(e) => ServerMessage::from(&e),
            },
        ),

        ClientMessage::UpdateTurnOrder {
            session_id,
            updates,
        } => Some(reply(
            state
                .update_turn_order(&session_id, customer_id, &updates)
                .await,
        )),

        ClientMessage::ShufflePlayers { session_id } => {
            Some(reply(state.shuffle_players(&session_id, customer_id).await))
        }

        ClientMessage::KickPlayer {
            session_id,
            player_id,
        } => Some(reply(
            state
                .kick_player(&session_id, &player_id, customer_id)
                .await
                .map(|_| ()),
        )),

        ClientMessage::LeaveLobby { session_id } => {
            Some(reply(state.leave_lobby(&session_id, customer_id).await))
        }

        ClientMessage::EndLobby { session_id } => {
            Some(reply(state.end_lobby(&session_id, customer_id).await))
        }

        ClientMessage::GetLobbyData { session_id } => Some(
            match state.get_lobby_data(&session_id, customer_id).await {
                Ok(snapshot) => ServerMessage::Snapshot(snapshot),
                Err(e) => ServerMessage::from(&e),
            },
        ),

        ClientMessage::SendPeer {
            session_id,
            scope,
            event,
        } => {
            // Only members may broadcast, and the relay stamps the sender
            // identity itself so it cannot be spoofed.
            match state.find_membership(&session_id, customer_id).await {
                Some(player) => {
                    let msg = PeerMessage::new(event, customer_id, player.display_name);
                    state.send_peer(&session_id, scope, msg).await;
                    None
                }
                None => Some(ServerMessage::Error {
                    code: "UNAUTHORIZED".to_string(),
                    msg: "Not a player in this session".to_string(),
                }),
            }
        }
    }
}

fn reply(result: crate::error::GameResult<()>) -> ServerMessage {
    match result {
        Ok(()) => ServerMessage::Ok,
        Err(e) => ServerMessage::from(&e),
    }
}
