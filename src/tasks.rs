//! Background watchers.

use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;

const TURN_WATCH_INTERVAL: Duration = Duration::from_secs(5);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn a background task that skips turns whose storyteller stalled past
/// the turn timeout, so one absent player never freezes the whole lobby.
pub fn spawn_turn_timeout_watcher(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(TURN_WATCH_INTERVAL).await;

            for session_id in state.stalled_turn_sessions().await {
                match state.skip_turn(&session_id, "turn timed out").await {
                    Ok(result) if result.skipped => {
                        tracing::info!("Auto-skipped stalled turn in session {session_id}");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Failed to skip stalled turn in {session_id}: {e}");
                    }
                }
            }
        }
    });
}

/// Spawn a background task that deletes completed sessions after their
/// results display window and expires lobbies nobody ever started.
pub fn spawn_cleanup_watcher(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(CLEANUP_INTERVAL).await;
            state.sweep_sessions().await;
        }
    });
}
