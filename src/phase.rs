//! Derived game phase.
//!
//! The phase is never stored. Every client computes it from the last-fetched
//! authoritative snapshot, so any client reconnecting at any point lands on
//! the same screen as everyone else. The derivation must stay a pure
//! function of the snapshot; transient request-in-flight flags live in the
//! sync loop, not here.

use crate::protocol::LobbySnapshot;
use crate::types::SessionStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    SelectingTheme,
    GeneratingSecret,
    Storytelling,
    Guessing,
    Scoring,
    Completed,
}

impl Phase {
    /// Ordered guards; earlier rules win.
    pub fn derive(snapshot: &LobbySnapshot) -> Phase {
        if matches!(
            snapshot.session.status,
            SessionStatus::Completed | SessionStatus::Expired
        ) {
            return Phase::Completed;
        }

        let turn = match &snapshot.current_turn {
            // Between turns (or before the first one): the storyteller is
            // picking a theme.
            None => return Phase::SelectingTheme,
            Some(turn) => turn,
        };

        if turn.theme_id.is_none() {
            Phase::SelectingTheme
        } else if !turn.has_secret {
            Phase::GeneratingSecret
        } else if turn.clue.is_none() {
            Phase::Storytelling
        } else if turn.completed_at.is_none() {
            Phase::Guessing
        } else {
            Phase::Scoring
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TurnView;
    use crate::types::*;

    fn session(status: SessionStatus) -> Session {
        Session {
            id: "sess_1".to_string(),
            lobby_code: "AB3CD9".to_string(),
            host_id: "host".to_string(),
            status,
            current_round: 1,
            total_rounds: 5,
            current_storyteller: Some("host".to_string()),
            theme_id: None,
            turn_mode: TurnMode::Audio,
            created_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
        }
    }

    fn turn_view(
        theme: Option<&str>,
        has_secret: bool,
        clue: Option<ClueArtifact>,
        completed: bool,
    ) -> TurnView {
        TurnView {
            id: "turn_1".to_string(),
            round_number: 1,
            storyteller_id: "host".to_string(),
            theme_id: theme.map(str::to_string),
            turn_mode: TurnMode::Audio,
            has_secret,
            secret: None,
            clue,
            completed_at: completed.then(|| chrono::Utc::now().to_rfc3339()),
        }
    }

    fn snapshot(status: SessionStatus, turn: Option<TurnView>) -> LobbySnapshot {
        LobbySnapshot {
            session: session(status),
            players: vec![],
            current_turn: turn,
            guesses: vec![],
            themes: vec![],
        }
    }

    #[test]
    fn test_completed_session_wins_over_everything() {
        let snap = snapshot(
            SessionStatus::Completed,
            Some(turn_view(Some("travel"), true, None, false)),
        );
        assert_eq!(Phase::derive(&snap), Phase::Completed);

        let snap = snapshot(SessionStatus::Expired, None);
        assert_eq!(Phase::derive(&snap), Phase::Completed);
    }

    #[test]
    fn test_no_turn_means_selecting_theme() {
        let snap = snapshot(SessionStatus::Active, None);
        assert_eq!(Phase::derive(&snap), Phase::SelectingTheme);
    }

    #[test]
    fn test_turn_without_theme_means_selecting_theme() {
        let snap = snapshot(SessionStatus::Active, Some(turn_view(None, false, None, false)));
        assert_eq!(Phase::derive(&snap), Phase::SelectingTheme);
    }

    #[test]
    fn test_theme_without_secret_means_generating() {
        let snap = snapshot(
            SessionStatus::Active,
            Some(turn_view(Some("travel"), false, None, false)),
        );
        assert_eq!(Phase::derive(&snap), Phase::GeneratingSecret);
    }

    #[test]
    fn test_secret_without_clue_means_storytelling() {
        let snap = snapshot(
            SessionStatus::Active,
            Some(turn_view(Some("travel"), true, None, false)),
        );
        assert_eq!(Phase::derive(&snap), Phase::Storytelling);
    }

    #[test]
    fn test_clue_without_completion_means_guessing() {
        let clue = ClueArtifact::Recording {
            url: "audio/turn_1.webm".to_string(),
        };
        let snap = snapshot(
            SessionStatus::Active,
            Some(turn_view(Some("travel"), true, Some(clue), false)),
        );
        assert_eq!(Phase::derive(&snap), Phase::Guessing);
    }

    #[test]
    fn test_completed_turn_means_scoring() {
        let clue = ClueArtifact::Icons {
            icon_ids: vec!["icon_1".to_string(), "icon_2".to_string()],
        };
        let snap = snapshot(
            SessionStatus::Active,
            Some(turn_view(Some("travel"), true, Some(clue), true)),
        );
        assert_eq!(Phase::derive(&snap), Phase::Scoring);
    }

    #[test]
    fn test_derivation_is_idempotent() {
        let snap = snapshot(
            SessionStatus::Active,
            Some(turn_view(Some("travel"), true, None, false)),
        );
        let first = Phase::derive(&snap);
        let second = Phase::derive(&snap);
        assert_eq!(first, second);
        // A second "client" deriving from a clone of the same snapshot
        // must agree.
        assert_eq!(Phase::derive(&snap.clone()), first);
    }
}
