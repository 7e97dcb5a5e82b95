//! Guess submission, scoring, round resolution, and advancement.

use super::AppState;
use crate::config::{POINTS_CORRECT_GUESS, POINTS_STORYTELLER_PER_CORRECT};
use crate::error::{GameError, GameResult};
use crate::protocol::{RowEvent, SubmitGuessResult, Table};
use crate::types::*;

impl AppState {
    /// Submit one guess for the current round. One guess per player per
    /// round; correctness is checked case-insensitively against the secret.
    /// When the last non-storyteller guess arrives, the round resolves:
    /// the turn is marked completed and the storyteller is scored. Round
    /// advancement itself stays a separate call so clients can show the
    /// results screen first.
    pub async fn submit_guess(
        &self,
        session_id: &str,
        caller: &str,
        round_number: u32,
        guess_text: &str,
    ) -> GameResult<SubmitGuessResult> {
        let text = guess_text.trim();
        if text.is_empty() {
            return Err(GameError::validation("Guess cannot be empty"));
        }

        let session = self.get_session(session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(GameError::conflict("Game is not active"));
        }
        if round_number != session.current_round {
            return Err(GameError::conflict("Guess is for a different round"));
        }
        if session.is_storyteller(caller) {
            return Err(GameError::validation("The storyteller cannot guess"));
        }
        let guesser = self
            .find_membership(session_id, caller)
            .await
            .ok_or_else(|| GameError::unauthorized("Not a player in this session"))?;

        let turn = self
            .current_turn(&session)
            .await
            .ok_or_else(|| GameError::not_found("No turn in progress"))?;
        if turn.is_completed() {
            return Err(GameError::conflict("Guessing for this round has closed"));
        }
        if turn.clue.is_none() {
            return Err(GameError::conflict("The clue is not ready yet"));
        }
        let secret = turn
            .secret
            .clone()
            .ok_or_else(|| GameError::conflict("Turn has no secret"))?;

        let correct = text.eq_ignore_ascii_case(secret.answer().trim());

        // Duplicate check and insert under one write guard so a double-send
        // cannot record two guesses.
        let round_guesses = {
            let mut guesses = self.guesses.write().await;
            let duplicate = guesses.values().any(|g| {
                g.session_id == session_id
                    && g.round_number == round_number
                    && g.player_id == caller
            });
            if duplicate {
                return Err(GameError::conflict("Already guessed this round"));
            }
            let guess = Guess {
                id: ulid::Ulid::new().to_string(),
                session_id: session_id.to_string(),
                round_number,
                player_id: caller.to_string(),
                text: text.to_string(),
                correct,
                ts: chrono::Utc::now().to_rfc3339(),
            };
            guesses.insert(guess.id.clone(), guess);
            guesses
                .values()
                .filter(|g| g.session_id == session_id && g.round_number == round_number)
                .cloned()
                .collect::<Vec<Guess>>()
        };
        self.notify(RowEvent::Insert, Table::Guesses, session_id);

        let mut points_earned = 0;
        if correct {
            points_earned = POINTS_CORRECT_GUESS;
            self.award_points(&guesser.id, POINTS_CORRECT_GUESS).await;
            self.notify(RowEvent::Update, Table::Players, session_id);
        }

        let players = self.players_in_session(session_id).await;
        let expected = players.len().saturating_sub(1);
        let all_players_answered = round_guesses.len() >= expected;

        let mut revealed = None;
        let mut next_round = None;
        let mut game_completed = false;
        if all_players_answered {
            self.resolve_round(&session, &turn, &round_guesses).await;
            revealed = Some(secret);
            if session.current_round + 1 > session.total_rounds {
                game_completed = true;
            } else {
                next_round = Some(session.current_round + 1);
            }
        }

        Ok(SubmitGuessResult {
            correct,
            points_earned,
            all_players_answered,
            secret: revealed,
            next_round,
            game_completed,
        })
    }

    /// Close the turn and score the storyteller. Idempotent against a
    /// concurrent skip: the timestamp is only written once.
    async fn resolve_round(&self, session: &Session, turn: &Turn, round_guesses: &[Guess]) {
        let already_done = {
            let mut turns = self.turns.write().await;
            match turns.get_mut(&turn.id) {
                Some(t) if !t.is_completed() => {
                    t.completed_at = Some(chrono::Utc::now().to_rfc3339());
                    false
                }
                _ => true,
            }
        };
        if already_done {
            return;
        }
        self.notify(RowEvent::Update, Table::Turns, &session.id);

        let correct_count = round_guesses.iter().filter(|g| g.correct).count() as u32;
        if correct_count > 0 {
            if let Some(storyteller) = self
                .find_membership(&session.id, &turn.storyteller_id)
                .await
            {
                self.award_points(&storyteller.id, correct_count * POINTS_STORYTELLER_PER_CORRECT)
                    .await;
                self.notify(RowEvent::Update, Table::Players, &session.id);
            }
        }
        tracing::info!(
            "Round {} resolved in session {} ({correct_count} correct)",
            session.current_round,
            session.id
        );
    }

    async fn award_points(&self, player_row_id: &str, points: u32) {
        let mut players = self.players.write().await;
        if let Some(player) = players.get_mut(player_row_id) {
            player.score += points;
        }
    }

    /// Advance past a resolved round. Safe to call from every client after
    /// the results display: the first call moves the game forward, the rest
    /// are no-ops because the new round has no turn yet.
    pub async fn advance_round(&self, session_id: &str) -> GameResult<()> {
        let session = self.get_session(session_id).await?;
        if session.status != SessionStatus::Active {
            return Ok(());
        }
        match self.current_turn(&session).await {
            Some(turn) if turn.is_completed() => {
                self.advance_session(session_id, session.current_round).await?;
                Ok(())
            }
            Some(_) => Err(GameError::conflict("Current turn has not ended")),
            // Already advanced (or the round's turn was never started)
            None => Ok(()),
        }
    }

    /// Bump to the next round or complete the game. `from_round` guards
    /// against concurrent callers: a stale caller observes the bump someone
    /// else already made and changes nothing.
    pub(crate) async fn advance_session(
        &self,
        session_id: &str,
        from_round: u32,
    ) -> GameResult<(Option<u32>, bool)> {
        let players = self.players_in_session(session_id).await;

        let outcome = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| GameError::not_found("Session not found"))?;
            if session.current_round != from_round || session.status != SessionStatus::Active {
                let completed = session.status == SessionStatus::Completed;
                let round = (!completed).then_some(session.current_round);
                return Ok((round, completed));
            }

            let next = session.current_round + 1;
            if next > session.total_rounds {
                session.status = SessionStatus::Completed;
                session.completed_at = Some(chrono::Utc::now().to_rfc3339());
                session.current_storyteller = None;
                session.theme_id = None;
                (None, true)
            } else {
                session.current_round = next;
                session.current_storyteller = Self::storyteller_for_round(&players, next);
                session.theme_id = None;
                (Some(next), false)
            }
        };
        self.notify(RowEvent::Update, Table::Sessions, session_id);

        match outcome {
            (None, true) => tracing::info!("Session {session_id} completed"),
            (Some(next), _) => tracing::info!("Session {session_id} advanced to round {next}"),
            _ => {}
        }
        Ok(outcome)
    }

    /// Final standing: highest score wins, ties broken by the earlier turn
    /// order so the result is stable.
    pub fn winner_of(players: &[Player]) -> Option<&Player> {
        players
            .iter()
            .max_by(|a, b| a.score.cmp(&b.score).then(b.turn_order.cmp(&a.turn_order)))
    }
}
