//! Session lifecycle: create, join, start, end, expiry and delayed cleanup.

use super::AppState;
use crate::config::{LOBBY_CAPACITY, MIN_PLAYERS};
use crate::error::{GameError, GameResult};
use crate::protocol::{JoinOutcome, JoinResult, RowEvent, Table};
use crate::types::*;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

impl AppState {
    /// Create a session with the caller as host (and first player)
    pub async fn create_session(
        &self,
        host_id: &str,
        host_name: &str,
    ) -> GameResult<Session> {
        if host_name.trim().is_empty() {
            return Err(GameError::validation("Player name cannot be empty"));
        }

        // Code uniqueness check and insert share one write guard so two
        // concurrent creates cannot draw the same code. Collisions are rare
        // but retried.
        let session = {
            let mut sessions = self.sessions.write().await;
            let lobby_code = loop {
                let code = generate_lobby_code();
                if !sessions.values().any(|s| s.lobby_code == code) {
                    break code;
                }
            };

            let session = Session {
                id: ulid::Ulid::new().to_string(),
                lobby_code,
                host_id: host_id.to_string(),
                status: SessionStatus::Waiting,
                current_round: 0,
                total_rounds: self.config.default_total_rounds,
                current_storyteller: None,
                theme_id: None,
                turn_mode: TurnMode::Audio,
                created_at: Utc::now().to_rfc3339(),
                completed_at: None,
            };
            sessions.insert(session.id.clone(), session.clone());
            session
        };

        let host_player = Player {
            id: ulid::Ulid::new().to_string(),
            session_id: session.id.clone(),
            customer_id: host_id.to_string(),
            display_name: host_name.trim().to_string(),
            turn_order: 1,
            score: 0,
            joined_at: Utc::now().to_rfc3339(),
        };
        self.players
            .write()
            .await
            .insert(host_player.id.clone(), host_player);

        self.notify(RowEvent::Insert, Table::Sessions, &session.id);
        self.notify(RowEvent::Insert, Table::Players, &session.id);

        tracing::info!("Created session {} (code {})", session.id, session.lobby_code);
        Ok(session)
    }

    /// Join a lobby by code. Re-joining with the same identity returns the
    /// existing membership instead of erroring.
    pub async fn join(
        &self,
        lobby_code: &str,
        player_name: &str,
        player_id: Option<CustomerId>,
    ) -> GameResult<JoinResult> {
        let code = lobby_code.trim().to_ascii_uppercase();
        if !is_valid_lobby_code(&code) {
            return Err(GameError::validation("Invalid lobby code"));
        }

        let session = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .find(|s| {
                    s.lobby_code == code
                        && !matches!(s.status, SessionStatus::Completed | SessionStatus::Expired)
                })
                .cloned()
                .ok_or_else(|| GameError::not_found("No lobby with that code"))?
        };

        let customer_id = player_id.unwrap_or_else(generate_guest_id);
        let name = if player_name.trim().is_empty() {
            generate_guest_name()
        } else {
            player_name.trim().to_string()
        };

        // The idempotent re-join check, capacity check and turn-order
        // assignment all share one write guard so two simultaneous joins with
        // the same identity cannot both insert a membership row.
        let player = {
            let mut players = self.players.write().await;

            if let Some(existing) = players
                .values()
                .find(|p| p.session_id == session.id && p.customer_id == customer_id)
                .cloned()
            {
                return Ok(JoinResult {
                    session,
                    player: existing,
                    outcome: JoinOutcome::AlreadyInLobby,
                });
            }

            if session.status != SessionStatus::Waiting {
                return Err(GameError::conflict("Game already started"));
            }

            let existing: Vec<&Player> = players
                .values()
                .filter(|p| p.session_id == session.id)
                .collect();
            if existing.len() >= LOBBY_CAPACITY {
                return Err(GameError::LobbyFull);
            }
            let next_order = existing.iter().map(|p| p.turn_order).max().unwrap_or(0) + 1;

            let player = Player {
                id: ulid::Ulid::new().to_string(),
                session_id: session.id.clone(),
                customer_id,
                display_name: name,
                turn_order: next_order,
                score: 0,
                joined_at: Utc::now().to_rfc3339(),
            };
            players.insert(player.id.clone(), player.clone());
            player
        };

        self.notify(RowEvent::Insert, Table::Players, &session.id);
        tracing::info!(
            "Player {} joined session {} at turn order {}",
            player.display_name,
            session.id,
            player.turn_order
        );

        Ok(JoinResult {
            session,
            player,
            outcome: JoinOutcome::Joined,
        })
    }

    /// Start the game. Host only; requires the minimum player count.
    pub async fn start_game(&self, session_id: &str, caller: &str) -> GameResult<()> {
        let players = self.players_in_session(session_id).await;

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| GameError::not_found("Session not found"))?;

        if !session.is_host(caller) {
            return Err(GameError::unauthorized("Only the host can start the game"));
        }
        if session.status != SessionStatus::Waiting {
            return Err(GameError::conflict("Game already started"));
        }
        if players.len() < MIN_PLAYERS {
            return Err(GameError::validation(format!(
                "Need at least {MIN_PLAYERS} players to start"
            )));
        }

        session.status = SessionStatus::Active;
        session.current_round = 1;
        session.current_storyteller = Self::storyteller_for_round(&players, 1);
        drop(sessions);

        self.notify(RowEvent::Update, Table::Sessions, session_id);
        tracing::info!("Session {} started with {} players", session_id, players.len());
        Ok(())
    }

    /// Delete the session and all dependent rows. Host only.
    pub async fn end_lobby(&self, session_id: &str, caller: &str) -> GameResult<()> {
        {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(session_id)
                .ok_or_else(|| GameError::not_found("Session not found"))?;
            if !session.is_host(caller) {
                return Err(GameError::unauthorized("Only the host can end the lobby"));
            }
        }
        self.delete_session(session_id).await;
        Ok(())
    }

    /// Remove a session row and everything hanging off it, then notify
    pub(crate) async fn delete_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
        self.players
            .write()
            .await
            .retain(|_, p| p.session_id != session_id);
        self.turns
            .write()
            .await
            .retain(|_, t| t.session_id != session_id);
        self.guesses
            .write()
            .await
            .retain(|_, g| g.session_id != session_id);

        self.notify(RowEvent::Delete, Table::Sessions, session_id);
        self.drop_peer_channels(session_id).await;
        tracing::info!("Deleted session {}", session_id);
    }

    /// Delete completed sessions whose display window has elapsed and expire
    /// waiting lobbies nobody ever started. Called by the cleanup watcher.
    pub async fn sweep_sessions(&self) {
        let now = Utc::now();
        let cleanup_after = ChronoDuration::from_std(self.config.cleanup_delay)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        let expire_after = ChronoDuration::from_std(self.config.lobby_expiry)
            .unwrap_or_else(|_| ChronoDuration::hours(1));

        let mut to_delete = Vec::new();
        let mut to_expire = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for session in sessions.values() {
                match session.status {
                    SessionStatus::Completed => {
                        if let Some(done) = parse_ts(session.completed_at.as_deref()) {
                            if now - done >= cleanup_after {
                                to_delete.push(session.id.clone());
                            }
                        }
                    }
                    SessionStatus::Waiting => {
                        if let Some(created) = parse_ts(Some(&session.created_at)) {
                            if now - created >= expire_after {
                                to_expire.push(session.id.clone());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        for id in to_delete {
            self.delete_session(&id).await;
        }
        for id in to_expire {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&id) {
                session.status = SessionStatus::Expired;
            }
            drop(sessions);
            self.notify(RowEvent::Update, Table::Sessions, &id);
            tracing::info!("Expired stale lobby {}", id);
        }
    }
}

fn parse_ts(ts: Option<&str>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use std::time::Duration;

    async fn lobby_of(state: &AppState, n: usize) -> Session {
        let session = state.create_session("cust_1", "P1").await.unwrap();
        for i in 2..=n {
            state
                .join(&session.lobby_code, &format!("P{i}"), Some(format!("cust_{i}")))
                .await
                .unwrap();
        }
        session
    }

    #[tokio::test]
    async fn test_start_requires_minimum_players() {
        let state = AppState::default();
        let session = lobby_of(&state, 3).await;

        let err = state.start_game(&session.id, "cust_1").await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");

        state
            .join(&session.lobby_code, "P4", Some("cust_4".to_string()))
            .await
            .unwrap();
        state.start_game(&session.id, "cust_1").await.unwrap();

        let session = state.get_session(&session.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.current_round, 1);
        assert_eq!(session.current_storyteller.as_deref(), Some("cust_1"));
    }

    #[tokio::test]
    async fn test_start_rejects_non_host_and_double_start() {
        let state = AppState::default();
        let session = lobby_of(&state, 4).await;

        let err = state.start_game(&session.id, "cust_2").await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");

        state.start_game(&session.id, "cust_1").await.unwrap();
        let err = state.start_game(&session.id, "cust_1").await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_join_rejected_after_start() {
        let state = AppState::default();
        let session = lobby_of(&state, 4).await;
        state.start_game(&session.id, "cust_1").await.unwrap();

        let err = state
            .join(&session.lobby_code, "Late", Some("cust_late".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        // ...but an existing member may still re-join (reconnect)
        let rejoin = state
            .join(&session.lobby_code, "P2", Some("cust_2".to_string()))
            .await
            .unwrap();
        assert_eq!(rejoin.outcome, JoinOutcome::AlreadyInLobby);
    }

    #[tokio::test]
    async fn test_lobby_capacity() {
        let state = AppState::default();
        let session = lobby_of(&state, LOBBY_CAPACITY).await;

        let err = state
            .join(&session.lobby_code, "Overflow", Some("cust_x".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err, GameError::LobbyFull);
    }

    #[tokio::test]
    async fn test_simultaneous_joins_with_same_identity_create_one_row() {
        let state = AppState::default();
        let session = state.create_session("cust_1", "P1").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            let code = session.lobby_code.clone();
            handles.push(tokio::spawn(async move {
                state.join(&code, "Arlo", Some("cust_dup".to_string())).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let players = state.players_in_session(&session.id).await;
        assert_eq!(players.len(), 2);
        assert_eq!(
            players.iter().filter(|p| p.customer_id == "cust_dup").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_simultaneous_creates_draw_distinct_codes() {
        let state = AppState::default();

        let mut handles = Vec::new();
        for i in 0..16 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                state.create_session(&format!("cust_{i}"), "Host").await
            }));
        }

        let mut codes = std::collections::BTreeSet::new();
        for handle in handles {
            codes.insert(handle.await.unwrap().unwrap().lobby_code);
        }
        assert_eq!(codes.len(), 16);
    }

    #[tokio::test]
    async fn test_guest_join_gets_identity_and_name() {
        let state = AppState::default();
        let session = state.create_session("cust_1", "Hannah").await.unwrap();

        let joined = state.join(&session.lobby_code, "  ", None).await.unwrap();
        assert!(joined.player.customer_id.starts_with("guest_"));
        assert!(!joined.player.display_name.trim().is_empty());
    }

    #[tokio::test]
    async fn test_end_lobby_deletes_everything() {
        let state = AppState::default();
        let session = lobby_of(&state, 4).await;

        let err = state.end_lobby(&session.id, "cust_2").await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");

        state.end_lobby(&session.id, "cust_1").await.unwrap();
        assert!(state.get_session(&session.id).await.is_err());
        assert!(state.players_in_session(&session.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_deletes_completed_after_delay() {
        let config = GameConfig {
            cleanup_delay: Duration::from_secs(0),
            ..GameConfig::default()
        };
        let state = AppState::new(config);
        let session = lobby_of(&state, 4).await;

        {
            let mut sessions = state.sessions.write().await;
            let s = sessions.get_mut(&session.id).unwrap();
            s.status = SessionStatus::Completed;
            s.completed_at = Some(Utc::now().to_rfc3339());
        }

        state.sweep_sessions().await;
        assert!(state.get_session(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_expires_stale_waiting_lobby() {
        let config = GameConfig {
            lobby_expiry: Duration::from_secs(0),
            ..GameConfig::default()
        };
        let state = AppState::new(config);
        let session = state.create_session("cust_1", "Hannah").await.unwrap();

        state.sweep_sessions().await;
        let session = state.get_session(&session.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Expired);
    }
}
