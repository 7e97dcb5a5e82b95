//! Error taxonomy for the game procedures.
//!
//! Every procedure returns a structured error rather than an opaque string.
//! `code()` maps each variant to the wire-level error code clients match on.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GameError {
    /// Bad input: malformed lobby code, empty name, duplicate guess, ...
    #[error("{0}")]
    Validation(String),

    /// Caller is not allowed to perform this action (non-host kick, etc.)
    #[error("{0}")]
    Unauthorized(String),

    /// State moved underneath the caller (game already started, turn already
    /// completed, ...); the right response is a re-fetch, not a retry
    #[error("{0}")]
    Conflict(String),

    /// Referenced row does not exist (or no longer exists)
    #[error("{0}")]
    NotFound(String),

    #[error("Lobby is full")]
    LobbyFull,
}

impl GameError {
    pub fn code(&self) -> &'static str {
        match self {
            GameError::Validation(_) => "VALIDATION_FAILED",
            GameError::Unauthorized(_) => "UNAUTHORIZED",
            GameError::Conflict(_) => "CONFLICT",
            GameError::NotFound(_) => "NOT_FOUND",
            GameError::LobbyFull => "LOBBY_FULL",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        GameError::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        GameError::Unauthorized(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        GameError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        GameError::NotFound(msg.into())
    }
}

pub type GameResult<T> = Result<T, GameError>;
