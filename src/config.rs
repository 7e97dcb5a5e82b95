//! Runtime configuration, read once from the environment at startup.

use std::time::Duration;

/// Minimum players required before the host can start the game
pub const MIN_PLAYERS: usize = 4;
/// Fixed lobby capacity
pub const LOBBY_CAPACITY: usize = 12;
/// Points a correct guesser earns
pub const POINTS_CORRECT_GUESS: u32 = 10;
/// Points the storyteller earns per correct guesser
pub const POINTS_STORYTELLER_PER_CORRECT: u32 = 5;

#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Rounds per game unless the host configures otherwise
    pub default_total_rounds: u32,
    /// How long clients display round results before advancing
    pub scoring_display_delay: Duration,
    /// How long a storyteller may stall before the skip watcher fires
    pub turn_timeout: Duration,
    /// Delay between game completion and session-row deletion
    pub cleanup_delay: Duration,
    /// How long a client keeps the final snapshot on screen after the
    /// session row disappears
    pub deletion_grace: Duration,
    /// Waiting lobbies older than this are expired
    pub lobby_expiry: Duration,
    /// Debounce window the reconciliation loop uses to collapse event bursts
    pub refetch_debounce: Duration,
    pub port: u16,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            default_total_rounds: 5,
            scoring_display_delay: Duration::from_secs(8),
            turn_timeout: Duration::from_secs(180),
            cleanup_delay: Duration::from_secs(60),
            deletion_grace: Duration::from_secs(8),
            lobby_expiry: Duration::from_secs(60 * 60),
            refetch_debounce: Duration::from_millis(150),
            port: 8420,
        }
    }
}

impl GameConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_total_rounds: env_parse("PHRASEOTOMY_TOTAL_ROUNDS")
                .unwrap_or(defaults.default_total_rounds),
            scoring_display_delay: env_secs("PHRASEOTOMY_SCORING_DELAY_SECS")
                .unwrap_or(defaults.scoring_display_delay),
            turn_timeout: env_secs("PHRASEOTOMY_TURN_TIMEOUT_SECS")
                .unwrap_or(defaults.turn_timeout),
            cleanup_delay: env_secs("PHRASEOTOMY_CLEANUP_DELAY_SECS")
                .unwrap_or(defaults.cleanup_delay),
            deletion_grace: env_secs("PHRASEOTOMY_DELETION_GRACE_SECS")
                .unwrap_or(defaults.deletion_grace),
            lobby_expiry: env_secs("PHRASEOTOMY_LOBBY_EXPIRY_SECS")
                .unwrap_or(defaults.lobby_expiry),
            refetch_debounce: env_parse("PHRASEOTOMY_DEBOUNCE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.refetch_debounce),
            port: env_parse("PHRASEOTOMY_PORT").unwrap_or(defaults.port),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse(key).map(Duration::from_secs)
}
