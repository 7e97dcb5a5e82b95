mod guess;
mod players;
mod session;
mod themes;
mod turn;

use crate::config::GameConfig;
use crate::error::{GameError, GameResult};
use crate::protocol::{ChangeEvent, LobbySnapshot, PeerMessage, PeerScope, RowEvent, Table, TurnView};
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Authoritative session store plus the notification bus.
///
/// The tables are the single source of truth for all four entities; every
/// mutation goes through one of the procedure methods in the sibling modules
/// and ends with a [`ChangeEvent`] fan-out. Peer broadcast channels are
/// created on demand per (session, scope) and never persist anything.
#[derive(Clone)]
pub struct AppState {
    pub config: GameConfig,
    pub sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
    pub players: Arc<RwLock<HashMap<PlayerId, Player>>>,
    pub turns: Arc<RwLock<HashMap<TurnId, Turn>>>,
    pub guesses: Arc<RwLock<HashMap<GuessId, Guess>>>,
    /// Seeded theme catalogue, read-only at runtime
    pub themes: Arc<Vec<Theme>>,
    changes: broadcast::Sender<ChangeEvent>,
    peer_channels: Arc<RwLock<HashMap<(SessionId, PeerScope), broadcast::Sender<PeerMessage>>>>,
}

impl AppState {
    pub fn new(config: GameConfig) -> Self {
        let (changes, _rx) = broadcast::channel(256);
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            players: Arc::new(RwLock::new(HashMap::new())),
            turns: Arc::new(RwLock::new(HashMap::new())),
            guesses: Arc::new(RwLock::new(HashMap::new())),
            themes: Arc::new(themes::seed_catalogue()),
            changes,
            peer_channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fan out a row-change notification. No receivers connected is fine.
    pub(crate) fn notify(&self, event: RowEvent, table: Table, session_id: &str) {
        let _ = self.changes.send(ChangeEvent {
            event,
            table,
            session_id: session_id.to_string(),
        });
    }

    /// Subscribe to row-change notifications. The stream is global; clients
    /// filter by `session_id`.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Subscribe to the peer broadcast channel for one session and screen
    pub async fn subscribe_peers(
        &self,
        session_id: &str,
        scope: PeerScope,
    ) -> broadcast::Receiver<PeerMessage> {
        self.peer_sender(session_id, scope).await.subscribe()
    }

    /// Relay a fire-and-forget peer broadcast. Delivery is best effort;
    /// senders never wait on it.
    pub async fn send_peer(&self, session_id: &str, scope: PeerScope, msg: PeerMessage) {
        let _ = self.peer_sender(session_id, scope).await.send(msg);
    }

    async fn peer_sender(
        &self,
        session_id: &str,
        scope: PeerScope,
    ) -> broadcast::Sender<PeerMessage> {
        let key = (session_id.to_string(), scope);
        {
            let channels = self.peer_channels.read().await;
            if let Some(tx) = channels.get(&key) {
                return tx.clone();
            }
        }
        let mut channels = self.peer_channels.write().await;
        channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    /// Drop the peer channels of a deleted session
    pub(crate) async fn drop_peer_channels(&self, session_id: &str) {
        let mut channels = self.peer_channels.write().await;
        channels.retain(|(sid, _), _| sid != session_id);
    }

    pub async fn get_session(&self, session_id: &str) -> GameResult<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| GameError::not_found("Session not found"))
    }

    /// Players of one session, sorted by turn order
    pub async fn players_in_session(&self, session_id: &str) -> Vec<Player> {
        let players = self.players.read().await;
        let mut list: Vec<Player> = players
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        list.sort_by_key(|p| p.turn_order);
        list
    }

    pub async fn find_membership(&self, session_id: &str, customer_id: &str) -> Option<Player> {
        self.players
            .read()
            .await
            .values()
            .find(|p| p.session_id == session_id && p.customer_id == customer_id)
            .cloned()
    }

    /// Turn row for the session's current round, if one was started
    pub async fn current_turn(&self, session: &Session) -> Option<Turn> {
        self.turns
            .read()
            .await
            .values()
            .find(|t| t.session_id == session.id && t.round_number == session.current_round)
            .cloned()
    }

    pub fn theme(&self, theme_id: &str) -> GameResult<&Theme> {
        self.themes
            .iter()
            .find(|t| t.id == theme_id)
            .ok_or_else(|| GameError::not_found("Theme not found"))
    }

    /// The canonical snapshot fetch used by the reconciliation loop.
    ///
    /// The projection never contains the secret for anyone but the
    /// storyteller (until the turn completes and reveal is safe).
    pub async fn get_lobby_data(
        &self,
        session_id: &str,
        customer_id: &str,
    ) -> GameResult<LobbySnapshot> {
        let session = self.get_session(session_id).await?;
        let players = self.players_in_session(session_id).await;
        let current_turn = self
            .current_turn(&session)
            .await
            .map(|t| TurnView::project(&t, customer_id));
        let guesses: Vec<Guess> = {
            let guesses = self.guesses.read().await;
            guesses
                .values()
                .filter(|g| g.session_id == session_id && g.round_number == session.current_round)
                .cloned()
                .collect()
        };

        Ok(LobbySnapshot {
            session,
            players,
            current_turn,
            guesses,
            themes: self.themes.as_ref().clone(),
        })
    }

    /// In-game variant of the snapshot fetch; same canonical shape
    pub async fn get_game_state(
        &self,
        session_id: &str,
        customer_id: &str,
    ) -> GameResult<LobbySnapshot> {
        self.get_lobby_data(session_id, customer_id).await
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(GameConfig::default())
    }
}
