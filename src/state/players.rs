//! Turn-order algorithms: shuffle, manual reorder, kick, leave, and the
//! storyteller lookup round advancement relies on.

use super::AppState;
use crate::error::{GameError, GameResult};
use crate::protocol::{RowEvent, Table, TurnOrderUpdate};
use crate::types::*;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap};

impl AppState {
    /// The storyteller whose turn the given round is.
    ///
    /// Normally `turn_order == round` (wrapping past the highest order for
    /// games longer than the roster). Kicks leave gaps without renumbering,
    /// so a missing order falls through to the next-higher one, wrapping to
    /// the lowest if the gap was at the end. This keeps advancement from
    /// stalling when a player was removed mid-game.
    pub(crate) fn storyteller_for_round(players: &[Player], round: u32) -> Option<CustomerId> {
        if round == 0 || players.is_empty() {
            return None;
        }
        let max_order = players.iter().map(|p| p.turn_order).max()?;
        let target = ((round - 1) % max_order) + 1;

        players
            .iter()
            .find(|p| p.turn_order == target)
            .or_else(|| {
                players
                    .iter()
                    .filter(|p| p.turn_order > target)
                    .min_by_key(|p| p.turn_order)
            })
            .or_else(|| players.iter().min_by_key(|p| p.turn_order))
            .map(|p| p.customer_id.clone())
    }

    /// Fisher–Yates shuffle of the roster with dense reassignment 1..N.
    /// Host only, and only while the lobby is waiting. The whole permutation
    /// is applied under one write guard so concurrent reorders serialize.
    pub async fn shuffle_players(&self, session_id: &str, caller: &str) -> GameResult<()> {
        self.require_waiting_host(session_id, caller).await?;

        {
            let mut players = self.players.write().await;
            let mut ids: Vec<PlayerId> = players
                .values()
                .filter(|p| p.session_id == session_id)
                .map(|p| p.id.clone())
                .collect();
            ids.shuffle(&mut rand::rng());
            for (index, id) in ids.iter().enumerate() {
                if let Some(player) = players.get_mut(id) {
                    player.turn_order = index as u32 + 1;
                }
            }
        }

        self.notify(RowEvent::Update, Table::Players, session_id);
        Ok(())
    }

    /// Bulk turn-order reassignment from a drag-drop reorder. The updates
    /// must cover the roster exactly with a dense permutation 1..N.
    pub async fn update_turn_order(
        &self,
        session_id: &str,
        caller: &str,
        updates: &[TurnOrderUpdate],
    ) -> GameResult<()> {
        self.require_waiting_host(session_id, caller).await?;

        let mut players = self.players.write().await;
        let roster: HashMap<CustomerId, PlayerId> = players
            .values()
            .filter(|p| p.session_id == session_id)
            .map(|p| (p.customer_id.clone(), p.id.clone()))
            .collect();

        if updates.len() != roster.len() {
            return Err(GameError::validation(
                "Turn order update must cover every player",
            ));
        }
        let ids: BTreeSet<&str> = updates.iter().map(|u| u.player_id.as_str()).collect();
        if ids.len() != updates.len() {
            return Err(GameError::validation(
                "Turn order update lists a player twice",
            ));
        }
        let orders: BTreeSet<u32> = updates.iter().map(|u| u.turn_order).collect();
        let expected: BTreeSet<u32> = (1..=roster.len() as u32).collect();
        if orders != expected {
            return Err(GameError::validation(
                "Turn orders must be a dense permutation of 1..N",
            ));
        }

        // Validate all referenced players before mutating anything
        let mut resolved = Vec::with_capacity(updates.len());
        for update in updates {
            let row_id = roster
                .get(&update.player_id)
                .ok_or_else(|| GameError::not_found("Player not in this session"))?;
            resolved.push((row_id.clone(), update.turn_order));
        }
        for (row_id, order) in resolved {
            if let Some(player) = players.get_mut(&row_id) {
                player.turn_order = order;
            }
        }
        drop(players);

        self.notify(RowEvent::Update, Table::Players, session_id);
        Ok(())
    }

    /// Remove a player from the lobby. Host only; the host cannot be kicked.
    /// Remaining players keep their turn_order (gaps are tolerated).
    pub async fn kick_player(
        &self,
        session_id: &str,
        player_to_kick: &str,
        caller: &str,
    ) -> GameResult<Player> {
        let session = self.get_session(session_id).await?;
        if !session.is_host(caller) {
            return Err(GameError::unauthorized("Only the host can kick players"));
        }
        if session.is_host(player_to_kick) {
            return Err(GameError::validation("Cannot kick the host"));
        }
        if session.status != SessionStatus::Waiting {
            return Err(GameError::conflict("Cannot kick after the game started"));
        }

        let kicked = self.remove_membership(session_id, player_to_kick).await?;
        tracing::info!("Kicked {} from session {}", kicked.display_name, session_id);
        Ok(kicked)
    }

    /// Voluntary leave. A host leaving a waiting lobby ends it for everyone;
    /// an empty session is deleted outright.
    pub async fn leave_lobby(&self, session_id: &str, caller: &str) -> GameResult<()> {
        let session = self.get_session(session_id).await?;

        if session.is_host(caller) && session.status == SessionStatus::Waiting {
            self.delete_session(session_id).await;
            return Ok(());
        }

        self.remove_membership(session_id, caller).await?;
        if self.players_in_session(session_id).await.is_empty() {
            self.delete_session(session_id).await;
        }
        Ok(())
    }

    async fn remove_membership(&self, session_id: &str, customer_id: &str) -> GameResult<Player> {
        let removed = {
            let mut players = self.players.write().await;
            let row_id = players
                .values()
                .find(|p| p.session_id == session_id && p.customer_id == customer_id)
                .map(|p| p.id.clone())
                .ok_or_else(|| GameError::not_found("Player not in this session"))?;
            players.remove(&row_id)
        };
        self.notify(RowEvent::Delete, Table::Players, session_id);
        removed.ok_or_else(|| GameError::not_found("Player not in this session"))
    }

    async fn require_waiting_host(&self, session_id: &str, caller: &str) -> GameResult<()> {
        let session = self.get_session(session_id).await?;
        if !session.is_host(caller) {
            return Err(GameError::unauthorized(
                "Only the host can change the turn order",
            ));
        }
        if session.status != SessionStatus::Waiting {
            return Err(GameError::conflict(
                "Turn order is locked once the game starts",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn orders(players: &[Player]) -> Vec<u32> {
        players.iter().map(|p| p.turn_order).collect()
    }

    #[tokio::test]
    async fn test_shuffle_keeps_orders_dense() {
        let state = AppState::default();
        let session = lobby_of(&state, 6).await;

        state.shuffle_players(&session.id, "cust_1").await.unwrap();

        let players = state.players_in_session(&session.id).await;
        assert_eq!(orders(&players), vec![1, 2, 3, 4, 5, 6]);
        // Every original player is still present exactly once
        let ids: BTreeSet<_> = players.iter().map(|p| p.customer_id.clone()).collect();
        assert_eq!(ids.len(), 6);
    }

    #[tokio::test]
    async fn test_manual_reorder_validates_density() {
        let state = AppState::default();
        let session = lobby_of(&state, 4).await;

        // Move cust_4 to the front
        let updates = vec![
            TurnOrderUpdate { player_id: "cust_4".to_string(), turn_order: 1 },
            TurnOrderUpdate { player_id: "cust_1".to_string(), turn_order: 2 },
            TurnOrderUpdate { player_id: "cust_2".to_string(), turn_order: 3 },
            TurnOrderUpdate { player_id: "cust_3".to_string(), turn_order: 4 },
        ];
        state
            .update_turn_order(&session.id, "cust_1", &updates)
            .await
            .unwrap();

        let players = state.players_in_session(&session.id).await;
        assert_eq!(players[0].customer_id, "cust_4");
        assert_eq!(orders(&players), vec![1, 2, 3, 4]);

        // Duplicate order is rejected
        let bad = vec![
            TurnOrderUpdate { player_id: "cust_1".to_string(), turn_order: 1 },
            TurnOrderUpdate { player_id: "cust_2".to_string(), turn_order: 1 },
            TurnOrderUpdate { player_id: "cust_3".to_string(), turn_order: 2 },
            TurnOrderUpdate { player_id: "cust_4".to_string(), turn_order: 3 },
        ];
        let err = state
            .update_turn_order(&session.id, "cust_1", &bad)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");

        // Partial update is rejected
        let partial = vec![TurnOrderUpdate {
            player_id: "cust_1".to_string(),
            turn_order: 1,
        }];
        let err = state
            .update_turn_order(&session.id, "cust_1", &partial)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn test_reorder_locked_after_start() {
        let state = AppState::default();
        let session = lobby_of(&state, 4).await;
        state.start_game(&session.id, "cust_1").await.unwrap();

        let err = state.shuffle_players(&session.id, "cust_1").await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_kick_rules() {
        let state = AppState::default();
        let session = lobby_of(&state, 4).await;

        // Non-host cannot kick
        let err = state
            .kick_player(&session.id, "cust_3", "cust_2")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");

        // Host cannot be kicked (which also covers kicking yourself)
        let err = state
            .kick_player(&session.id, "cust_1", "cust_1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");

        // Kick removes without renumbering
        state
            .kick_player(&session.id, "cust_2", "cust_1")
            .await
            .unwrap();
        let players = state.players_in_session(&session.id).await;
        assert_eq!(orders(&players), vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn test_storyteller_lookup_with_gaps() {
        let players: Vec<Player> = [1u32, 3, 4]
            .iter()
            .map(|&order| Player {
                id: format!("row_{order}"),
                session_id: "sess".to_string(),
                customer_id: format!("cust_{order}"),
                display_name: format!("P{order}"),
                turn_order: order,
                score: 0,
                joined_at: chrono::Utc::now().to_rfc3339(),
            })
            .collect();

        // Exact match
        assert_eq!(
            AppState::storyteller_for_round(&players, 1).as_deref(),
            Some("cust_1")
        );
        // Order 2 was removed: falls through to the next-higher order
        assert_eq!(
            AppState::storyteller_for_round(&players, 2).as_deref(),
            Some("cust_3")
        );
        // Wraps past the highest order for long games
        assert_eq!(
            AppState::storyteller_for_round(&players, 5).as_deref(),
            Some("cust_1")
        );

        assert_eq!(AppState::storyteller_for_round(&[], 1), None);
    }

    #[tokio::test]
    async fn test_host_leave_ends_waiting_lobby() {
        let state = AppState::default();
        let session = lobby_of(&state, 3).await;

        state.leave_lobby(&session.id, "cust_1").await.unwrap();
        assert!(state.get_session(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_leave_keeps_turn_orders_of_others() {
        let state = AppState::default();
        let session = lobby_of(&state, 4).await;
        state.start_game(&session.id, "cust_1").await.unwrap();

        state.leave_lobby(&session.id, "cust_2").await.unwrap();
        let players = state.players_in_session(&session.id).await;
        assert_eq!(orders(&players), vec![1, 3, 4]);
    }
}
