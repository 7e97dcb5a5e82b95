// Public API for integration tests and potential library usage

pub mod config;
pub mod error;
pub mod phase;
pub mod protocol;
pub mod state;
pub mod sync;
pub mod types;
pub mod ws;

// Re-export the background watchers for testing
pub mod tasks;
