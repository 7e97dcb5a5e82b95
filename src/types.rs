use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque ID types for type safety
pub type SessionId = String;
pub type PlayerId = String;
pub type CustomerId = String;
pub type TurnId = String;
pub type GuessId = String;
pub type ThemeId = String;
pub type IconId = String;

/// Safe character set for lobby codes (excludes 0/O and 1/I to avoid confusion)
const CODE_CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const LOBBY_CODE_LENGTH: usize = 6;

/// Generate a random lobby code (6 characters)
pub fn generate_lobby_code() -> String {
    let mut rng = rand::rng();
    (0..LOBBY_CODE_LENGTH)
        .map(|_| CODE_CHARS[rng.random_range(0..CODE_CHARS.len())] as char)
        .collect()
}

/// Check that a code looks like something `generate_lobby_code` produced
pub fn is_valid_lobby_code(code: &str) -> bool {
    code.len() == LOBBY_CODE_LENGTH && code.bytes().all(|b| CODE_CHARS.contains(&b))
}

/// Generate a guest identity for players without a customer account
pub fn generate_guest_id() -> CustomerId {
    format!("guest_{}", ulid::Ulid::new())
}

/// Friendly fallback display name (adjective + animal)
pub fn generate_guest_name() -> String {
    petname::petname(2, " ").unwrap_or_else(|| "Mystery Guest".to_string())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Active,
    Completed,
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnMode {
    Audio,
    Icons,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub lobby_code: String,
    pub host_id: CustomerId,
    pub status: SessionStatus,
    pub current_round: u32,
    pub total_rounds: u32,
    pub current_storyteller: Option<CustomerId>,
    pub theme_id: Option<ThemeId>,
    pub turn_mode: TurnMode,
    pub created_at: String,
    /// Set when the game completes; drives delayed cleanup
    pub completed_at: Option<String>,
}

impl Session {
    pub fn is_host(&self, customer_id: &str) -> bool {
        self.host_id == customer_id
    }

    pub fn is_storyteller(&self, customer_id: &str) -> bool {
        self.current_storyteller.as_deref() == Some(customer_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Player {
    pub id: PlayerId,
    pub session_id: SessionId,
    pub customer_id: CustomerId,
    pub display_name: String,
    /// Positive, unique within the session; dense 1..N except after a kick
    pub turn_order: u32,
    pub score: u32,
    pub joined_at: String,
}

/// The hidden payload the storyteller must clue toward
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Secret {
    Whisp { word: String },
    Icon { icon_id: IconId, name: String },
}

impl Secret {
    /// The text a guess is checked against
    pub fn answer(&self) -> &str {
        match self {
            Secret::Whisp { word } => word,
            Secret::Icon { name, .. } => name,
        }
    }
}

/// The clue the storyteller produced for the current turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClueArtifact {
    Recording { url: String },
    Icons { icon_ids: Vec<IconId> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub session_id: SessionId,
    pub round_number: u32,
    pub storyteller_id: CustomerId,
    pub theme_id: Option<ThemeId>,
    pub turn_mode: TurnMode,
    pub secret: Option<Secret>,
    pub clue: Option<ClueArtifact>,
    pub started_at: String,
    /// Immutable historical record once set
    pub completed_at: Option<String>,
}

impl Turn {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Guess {
    pub id: GuessId,
    pub session_id: SessionId,
    pub round_number: u32,
    pub player_id: CustomerId,
    pub text: String,
    pub correct: bool,
    pub ts: String,
}

/// An icon available inside a theme
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThemeIcon {
    pub id: IconId,
    pub name: String,
}

/// A theme from the seeded catalogue: whisp candidates plus selectable icons
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Theme {
    pub id: ThemeId,
    pub name: String,
    pub whisps: Vec<String>,
    pub icons: Vec<ThemeIcon>,
}
