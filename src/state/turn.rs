//! Storyteller turn lifecycle: theme selection, turn creation with secret
//! generation, the icon-secret pick, clue completion, and the skip path the
//! timeout watcher shares.

use super::AppState;
use crate::error::{GameError, GameResult};
use crate::protocol::{RowEvent, SkipTurnResult, StartTurnResult, Table, TurnView};
use crate::types::*;
use rand::seq::IndexedRandom;

impl AppState {
    /// Pre-turn theme pick shown to the whole lobby while the storyteller is
    /// still deciding. Storyteller only.
    pub async fn update_session_theme(
        &self,
        session_id: &str,
        caller: &str,
        theme_id: &str,
    ) -> GameResult<()> {
        let session = self.get_session(session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(GameError::conflict("Game is not active"));
        }
        if !session.is_storyteller(caller) {
            return Err(GameError::unauthorized(
                "Only the storyteller can pick the theme",
            ));
        }
        self.theme(theme_id)?;

        {
            let mut sessions = self.sessions.write().await;
            if let Some(s) = sessions.get_mut(session_id) {
                s.theme_id = Some(theme_id.to_string());
            }
        }
        self.notify(RowEvent::Update, Table::Sessions, session_id);
        Ok(())
    }

    /// Create the turn row for the current round and generate its secret.
    ///
    /// Audio turns draw a random whisp from the theme; icon turns start with
    /// a random icon (the storyteller may swap it via
    /// [`AppState::save_secret_element`] before producing the clue). At most
    /// one turn exists per round: calling again while one is open returns the
    /// existing turn unchanged, so a storyteller reconnecting mid-turn keeps
    /// their secret.
    pub async fn start_turn(
        &self,
        session_id: &str,
        caller: &str,
        theme_id: &str,
        turn_mode: Option<TurnMode>,
    ) -> GameResult<StartTurnResult> {
        let session = self.get_session(session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(GameError::conflict("Game is not active"));
        }
        if !session.is_storyteller(caller) {
            return Err(GameError::unauthorized(
                "Only the storyteller can start the turn",
            ));
        }

        let theme = self.theme(theme_id)?.clone();
        let mode = turn_mode.unwrap_or(session.turn_mode);

        // The existing-turn check and the insert share one write guard so two
        // concurrent calls cannot both create a turn for the round.
        let (view, secret) = {
            let mut turns = self.turns.write().await;

            if let Some(existing) = turns
                .values()
                .find(|t| t.session_id == session_id && t.round_number == session.current_round)
            {
                if existing.is_completed() {
                    return Err(GameError::conflict("This round's turn already ended"));
                }
                let secret = existing
                    .secret
                    .clone()
                    .ok_or_else(|| GameError::conflict("Turn has no secret yet"))?;
                return Ok(StartTurnResult {
                    turn: TurnView::project(existing, caller),
                    secret,
                });
            }

            let secret = Self::generate_secret(&theme, mode)?;
            let turn = Turn {
                id: ulid::Ulid::new().to_string(),
                session_id: session_id.to_string(),
                round_number: session.current_round,
                storyteller_id: caller.to_string(),
                theme_id: Some(theme.id.clone()),
                turn_mode: mode,
                secret: Some(secret.clone()),
                clue: None,
                started_at: chrono::Utc::now().to_rfc3339(),
                completed_at: None,
            };
            let view = TurnView::project(&turn, caller);
            turns.insert(turn.id.clone(), turn);
            (view, secret)
        };
        {
            let mut sessions = self.sessions.write().await;
            if let Some(s) = sessions.get_mut(session_id) {
                s.theme_id = Some(theme.id);
            }
        }
        self.notify(RowEvent::Insert, Table::Turns, session_id);
        self.notify(RowEvent::Update, Table::Sessions, session_id);

        tracing::info!(
            "Turn started in session {session_id}, round {}, mode {mode:?}",
            session.current_round
        );
        Ok(StartTurnResult { turn: view, secret })
    }

    fn generate_secret(theme: &Theme, mode: TurnMode) -> GameResult<Secret> {
        let mut rng = rand::rng();
        match mode {
            TurnMode::Audio => theme
                .whisps
                .choose(&mut rng)
                .map(|word| Secret::Whisp { word: word.clone() })
                .ok_or_else(|| GameError::conflict("Theme has no whisps")),
            TurnMode::Icons => theme
                .icons
                .choose(&mut rng)
                .map(|icon| Secret::Icon {
                    icon_id: icon.id.clone(),
                    name: icon.name.clone(),
                })
                .ok_or_else(|| GameError::conflict("Theme has no icons")),
        }
    }

    /// Replace the generated icon secret with one the storyteller picked.
    /// Only valid on an open icon turn that has no clue yet.
    pub async fn save_secret_element(
        &self,
        session_id: &str,
        caller: &str,
        icon_id: &str,
    ) -> GameResult<Secret> {
        let session = self.get_session(session_id).await?;
        if !session.is_storyteller(caller) {
            return Err(GameError::unauthorized(
                "Only the storyteller can change the secret",
            ));
        }
        let turn = self
            .current_turn(&session)
            .await
            .ok_or_else(|| GameError::not_found("No turn in progress"))?;
        if turn.is_completed() {
            return Err(GameError::conflict("Turn already completed"));
        }
        if turn.clue.is_some() {
            return Err(GameError::conflict("Clue already produced for this turn"));
        }
        if turn.turn_mode != TurnMode::Icons {
            return Err(GameError::validation("Secret icons only apply to icon turns"));
        }

        let theme_id = turn
            .theme_id
            .as_deref()
            .ok_or_else(|| GameError::conflict("Turn has no theme"))?;
        let icon = self
            .theme(theme_id)?
            .icons
            .iter()
            .find(|i| i.id == icon_id)
            .ok_or_else(|| GameError::not_found("Icon not in this theme"))?
            .clone();
        let secret = Secret::Icon {
            icon_id: icon.id,
            name: icon.name,
        };

        {
            let mut turns = self.turns.write().await;
            if let Some(t) = turns.get_mut(&turn.id) {
                t.secret = Some(secret.clone());
            }
        }
        self.notify(RowEvent::Update, Table::Turns, session_id);
        Ok(secret)
    }

    /// Attach the finished clue (recording reference or icon sequence) and
    /// open the turn for guessing. The artifact kind must match the turn
    /// mode, and icon sequences may only use icons from the turn's theme.
    pub async fn complete_clue(
        &self,
        session_id: &str,
        caller: &str,
        clue: ClueArtifact,
    ) -> GameResult<()> {
        let session = self.get_session(session_id).await?;
        if !session.is_storyteller(caller) {
            return Err(GameError::unauthorized(
                "Only the storyteller can submit the clue",
            ));
        }
        let turn = self
            .current_turn(&session)
            .await
            .ok_or_else(|| GameError::not_found("No turn in progress"))?;
        if turn.is_completed() {
            return Err(GameError::conflict("Turn already completed"));
        }
        if turn.secret.is_none() {
            return Err(GameError::conflict("Turn has no secret yet"));
        }
        if turn.clue.is_some() {
            return Err(GameError::conflict("Clue already produced for this turn"));
        }

        match (&clue, turn.turn_mode) {
            (ClueArtifact::Recording { url }, TurnMode::Audio) => {
                if url.trim().is_empty() {
                    return Err(GameError::validation("Recording reference is empty"));
                }
            }
            (ClueArtifact::Icons { icon_ids }, TurnMode::Icons) => {
                if icon_ids.is_empty() {
                    return Err(GameError::validation("Icon sequence is empty"));
                }
                let theme_id = turn
                    .theme_id
                    .as_deref()
                    .ok_or_else(|| GameError::conflict("Turn has no theme"))?;
                let theme = self.theme(theme_id)?;
                for icon_id in icon_ids {
                    if !theme.icons.iter().any(|i| &i.id == icon_id) {
                        return Err(GameError::validation("Icon not in this theme"));
                    }
                }
            }
            _ => {
                return Err(GameError::validation(
                    "Clue kind does not match the turn mode",
                ));
            }
        }

        {
            let mut turns = self.turns.write().await;
            if let Some(t) = turns.get_mut(&turn.id) {
                t.clue = Some(clue);
            }
        }
        self.notify(RowEvent::Update, Table::Turns, session_id);
        Ok(())
    }

    /// Abandon the current turn and move on. Used by the turn-timeout
    /// watcher for stalled storytellers; also reachable for a host that
    /// wants to force the game forward. No points are awarded.
    pub async fn skip_turn(&self, session_id: &str, reason: &str) -> GameResult<SkipTurnResult> {
        let session = self.get_session(session_id).await?;
        if session.status != SessionStatus::Active {
            return Ok(SkipTurnResult {
                skipped: false,
                next_round: None,
                game_completed: session.status == SessionStatus::Completed,
            });
        }

        if let Some(turn) = self.current_turn(&session).await {
            if !turn.is_completed() {
                let mut turns = self.turns.write().await;
                if let Some(t) = turns.get_mut(&turn.id) {
                    t.completed_at = Some(chrono::Utc::now().to_rfc3339());
                }
                drop(turns);
                self.notify(RowEvent::Update, Table::Turns, session_id);
            }
        }

        tracing::info!("Skipping turn in session {session_id}: {reason}");
        let (next_round, game_completed) =
            self.advance_session(session_id, session.current_round).await?;
        Ok(SkipTurnResult {
            skipped: true,
            next_round,
            game_completed,
        })
    }

    /// Sessions whose open turn has outlived the turn timeout. The timeout
    /// watcher skips these.
    pub async fn stalled_turn_sessions(&self) -> Vec<SessionId> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.config.turn_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(180));

        let sessions = self.sessions.read().await;
        let turns = self.turns.read().await;
        turns
            .values()
            .filter(|t| !t.is_completed())
            .filter(|t| {
                sessions
                    .get(&t.session_id)
                    .is_some_and(|s| s.status == SessionStatus::Active && s.current_round == t.round_number)
            })
            .filter(|t| {
                chrono::DateTime::parse_from_rfc3339(&t.started_at)
                    .map(|started| started.with_timezone(&chrono::Utc) <= cutoff)
                    .unwrap_or(false)
            })
            .map(|t| t.session_id.clone())
            .collect()
    }
}
