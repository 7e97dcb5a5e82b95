//! Wire types shared by the procedure layer, the notification bus, and the
//! client reconciliation loop.
//!
//! Two kinds of signals reach clients: row-level [`ChangeEvent`]s emitted
//! after every store mutation (the guaranteed path), and ephemeral
//! [`PeerMessage`] broadcasts sent client-to-client as latency hints (best
//! effort, never authoritative).

use crate::types::*;
use serde::{Deserialize, Serialize};

/// Row-level change notification, fanned out after every store mutation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub event: RowEvent,
    pub table: Table,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowEvent {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Sessions,
    Players,
    Turns,
    Guesses,
}

/// Which of the two screens a peer channel is scoped to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PeerScope {
    Lobby,
    Game,
}

/// Catalogue of peer broadcast events. Every variant is strictly a hint to
/// re-fetch authoritative state sooner; payloads are never merged into the
/// local snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum PeerEvent {
    PlayerJoined { customer_id: CustomerId, display_name: String },
    PlayerLeft { customer_id: CustomerId },
    PlayerKicked { customer_id: CustomerId },
    TurnOrderChanged,
    GameStarted,
    ThemeSelected { theme_id: ThemeId },
    RecordingReady,
    IconsSelected,
    GuessSubmitted { round_number: u32 },
    RoundAdvanced { round_number: u32 },
    LobbyEnded,
}

impl PeerEvent {
    /// Whether this event implies the shared state changed (and therefore an
    /// immediate re-fetch rather than waiting for the debounce window)
    pub fn implies_state_change(&self) -> bool {
        // Every catalogued event currently does; the match stays exhaustive
        // so new informational-only variants must opt out explicitly.
        match self {
            PeerEvent::PlayerJoined { .. }
            | PeerEvent::PlayerLeft { .. }
            | PeerEvent::PlayerKicked { .. }
            | PeerEvent::TurnOrderChanged
            | PeerEvent::GameStarted
            | PeerEvent::ThemeSelected { .. }
            | PeerEvent::RecordingReady
            | PeerEvent::IconsSelected
            | PeerEvent::GuessSubmitted { .. }
            | PeerEvent::RoundAdvanced { .. }
            | PeerEvent::LobbyEnded => true,
        }
    }
}

/// Fire-and-forget peer broadcast, relayed verbatim and never persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerMessage {
    pub event: PeerEvent,
    pub sender_id: CustomerId,
    pub sender_name: String,
    pub ts: String,
}

impl PeerMessage {
    pub fn new(event: PeerEvent, sender_id: impl Into<CustomerId>, sender_name: impl Into<String>) -> Self {
        Self {
            event,
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            ts: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Turn projection safe to hand to any client. The secret itself only
/// appears for the storyteller; everyone else sees `has_secret` so phase
/// derivation still works.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnView {
    pub id: TurnId,
    pub round_number: u32,
    pub storyteller_id: CustomerId,
    pub theme_id: Option<ThemeId>,
    pub turn_mode: TurnMode,
    pub has_secret: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<Secret>,
    pub clue: Option<ClueArtifact>,
    pub completed_at: Option<String>,
}

impl TurnView {
    /// Project a turn row for `viewer`. Completed turns reveal the secret to
    /// everyone (needed for round-results display).
    pub fn project(turn: &Turn, viewer: &str) -> Self {
        let reveal = turn.storyteller_id == viewer || turn.is_completed();
        Self {
            id: turn.id.clone(),
            round_number: turn.round_number,
            storyteller_id: turn.storyteller_id.clone(),
            theme_id: turn.theme_id.clone(),
            turn_mode: turn.turn_mode,
            has_secret: turn.secret.is_some(),
            secret: if reveal { turn.secret.clone() } else { None },
            clue: turn.clue.clone(),
            completed_at: turn.completed_at.clone(),
        }
    }
}

/// The canonical snapshot the reconciliation loop re-fetches after every
/// notification. Disposable; rebuilt in full, never patched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LobbySnapshot {
    pub session: Session,
    pub players: Vec<Player>,
    pub current_turn: Option<TurnView>,
    /// Guesses for the current round only
    pub guesses: Vec<Guess>,
    pub themes: Vec<Theme>,
}

// ---------- Procedure results ----------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JoinOutcome {
    Joined,
    AlreadyInLobby,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResult {
    pub session: Session,
    pub player: Player,
    pub outcome: JoinOutcome,
}

/// Returned from `start_turn` to the storyteller only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTurnResult {
    pub turn: TurnView,
    pub secret: Secret,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitGuessResult {
    pub correct: bool,
    pub points_earned: u32,
    pub all_players_answered: bool,
    /// Revealed once the round resolves
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<Secret>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_round: Option<u32>,
    pub game_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipTurnResult {
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_round: Option<u32>,
    pub game_completed: bool,
}

/// One entry of an `update_turn_order` bulk reassignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOrderUpdate {
    pub player_id: CustomerId,
    pub turn_order: u32,
}

// ---------- WebSocket envelope ----------

/// Messages a connected client may send. One variant per authorized
/// procedure, plus the fire-and-forget peer broadcast send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateLobby {
        host_name: String,
    },
    Join {
        lobby_code: String,
        player_name: String,
        player_id: Option<CustomerId>,
    },
    StartGame {
        session_id: SessionId,
    },
    UpdateSessionTheme {
        session_id: SessionId,
        theme_id: ThemeId,
    },
    StartTurn {
        session_id: SessionId,
        theme_id: ThemeId,
        turn_mode: Option<TurnMode>,
    },
    SaveSecretElement {
        session_id: SessionId,
        icon_id: IconId,
    },
    CompleteClue {
        session_id: SessionId,
        clue: ClueArtifact,
    },
    SubmitGuess {
        session_id: SessionId,
        round_number: u32,
        guess: String,
    },
    AdvanceRound {
        session_id: SessionId,
    },
    /// Host escape hatch for a stalled storyteller
    SkipTurn {
        session_id: SessionId,
    },
    UpdateTurnOrder {
        session_id: SessionId,
        updates: Vec<TurnOrderUpdate>,
    },
    ShufflePlayers {
        session_id: SessionId,
    },
    KickPlayer {
        session_id: SessionId,
        player_id: CustomerId,
    },
    LeaveLobby {
        session_id: SessionId,
    },
    EndLobby {
        session_id: SessionId,
    },
    GetLobbyData {
        session_id: SessionId,
    },
    /// Relay a peer broadcast to everyone subscribed to the scope
    SendPeer {
        session_id: SessionId,
        scope: PeerScope,
        event: PeerEvent,
    },
}

/// Messages the server pushes or returns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        protocol: String,
        customer_id: CustomerId,
        server_now: String,
    },
    Joined(JoinResult),
    Snapshot(LobbySnapshot),
    TurnStarted(StartTurnResult),
    GuessResult(SubmitGuessResult),
    /// Generic success for procedures with no payload
    Ok,
    Change(ChangeEvent),
    Peer(PeerMessage),
    Error {
        code: String,
        msg: String,
    },
}

impl From<&crate::error::GameError> for ServerMessage {
    fn from(e: &crate::error::GameError) -> Self {
        ServerMessage::Error {
            code: e.code().to_string(),
            msg: e.to_string(),
        }
    }
}
