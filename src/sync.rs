//! Client-side reconciliation loop.
//!
//! The loop owns a disposable [`LobbySnapshot`] and keeps it converged with
//! the authoritative store. Notifications and peer broadcasts are only ever
//! triggers to re-fetch the full snapshot; nothing received over a channel
//! is merged into local state. Re-fetches are debounced so a burst of row
//! changes (a shuffle touching every player, say) costs one fetch.

use crate::config::GameConfig;
use crate::error::{GameError, GameResult};
use crate::phase::Phase;
use crate::protocol::{
    ChangeEvent, LobbySnapshot, PeerEvent, PeerMessage, PeerScope, RowEvent, Table,
};
use crate::state::AppState;
use crate::types::{CustomerId, SessionId};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

/// Longest wait between retries of a failing snapshot fetch
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Where snapshots come from. The store implements this directly; tests
/// wrap it to observe fetch behavior.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch(&self, session_id: &str, customer_id: &str) -> GameResult<LobbySnapshot>;

    /// A fresh change subscription, for resubscribing after a dropped
    /// stream. Sources that cannot resubscribe return None.
    fn resubscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        None
    }
}

#[async_trait]
impl SnapshotSource for AppState {
    async fn fetch(&self, session_id: &str, customer_id: &str) -> GameResult<LobbySnapshot> {
        self.get_lobby_data(session_id, customer_id).await
    }

    fn resubscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        Some(self.subscribe_changes())
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Connectivity {
    Connecting,
    Subscribed,
    Error,
}

/// What the UI layer watches. Always the latest full snapshot plus the
/// phase derived from it.
#[derive(Debug, Clone)]
pub struct SyncUpdate {
    pub snapshot: Option<LobbySnapshot>,
    pub phase: Option<Phase>,
    pub connectivity: Connectivity,
    /// Display names announced over the peer channel but not yet present in
    /// an authoritative snapshot
    pub joining: Vec<String>,
}

impl SyncUpdate {
    fn initial() -> Self {
        Self {
            snapshot: None,
            phase: None,
            connectivity: Connectivity::Connecting,
            joining: Vec::new(),
        }
    }
}

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncExit {
    /// Our membership row disappeared (or a kick broadcast named us)
    Kicked,
    /// The session itself was deleted (or was already gone)
    SessionEnded,
    /// The notification stream closed and could not be resubscribed
    Disconnected,
}

enum FetchOutcome {
    Member,
    NotMember,
    Gone,
    Retry,
}

pub struct LobbyClient<S: SnapshotSource> {
    source: S,
    session_id: SessionId,
    customer_id: CustomerId,
    debounce: Duration,
    /// How long the final snapshot stays on screen after session deletion
    exit_grace: Duration,
    changes: broadcast::Receiver<ChangeEvent>,
    lobby_peers: broadcast::Receiver<PeerMessage>,
    game_peers: broadcast::Receiver<PeerMessage>,
    updates: watch::Sender<SyncUpdate>,
    /// Players announced via broadcast, pruned on every fetch
    announced: Vec<(CustomerId, String)>,
}

impl LobbyClient<AppState> {
    /// Subscribe to both signal paths and return the client plus the watch
    /// handle the UI reads from.
    pub async fn connect(
        state: &AppState,
        session_id: &str,
        customer_id: &str,
    ) -> (Self, watch::Receiver<SyncUpdate>) {
        let changes = state.subscribe_changes();
        let lobby_peers = state.subscribe_peers(session_id, PeerScope::Lobby).await;
        let game_peers = state.subscribe_peers(session_id, PeerScope::Game).await;
        Self::with_source(
            state.clone(),
            changes,
            lobby_peers,
            game_peers,
            session_id,
            customer_id,
            &state.config,
        )
    }
}

impl<S: SnapshotSource> LobbyClient<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn with_source(
        source: S,
        changes: broadcast::Receiver<ChangeEvent>,
        lobby_peers: broadcast::Receiver<PeerMessage>,
        game_peers: broadcast::Receiver<PeerMessage>,
        session_id: &str,
        customer_id: &str,
        config: &GameConfig,
    ) -> (Self, watch::Receiver<SyncUpdate>) {
        let (updates, rx) = watch::channel(SyncUpdate::initial());
        (
            Self {
                source,
                session_id: session_id.to_string(),
                customer_id: customer_id.to_string(),
                debounce: config.refetch_debounce,
                exit_grace: config.deletion_grace,
                changes,
                lobby_peers,
                game_peers,
                updates,
                announced: Vec::new(),
            },
            rx,
        )
    }

    /// Drive the loop until a terminal condition. The watch handle sees
    /// every published snapshot; the return value says why we stopped.
    pub async fn run(mut self) -> SyncExit {
        // First converge happens through the same path as every other fetch
        let mut refetch_at: Option<Instant> = Some(Instant::now());
        let mut backoff = self.debounce;

        let exit = loop {
            tokio::select! {
                change = self.changes.recv() => {
                    match change {
                        Ok(ev) if ev.session_id == self.session_id => {
                            if ev.table == Table::Sessions && ev.event == RowEvent::Delete {
                                tokio::time::sleep(self.exit_grace).await;
                                break SyncExit::SessionEnded;
                            }
                            Self::schedule(&mut refetch_at, self.debounce);
                        }
                        Ok(_) => {} // other session's rows
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Missed notifications are fine: one fetch
                            // re-converges regardless of what they were.
                            tracing::debug!("Change stream lagged by {missed}, re-fetching");
                            Self::schedule(&mut refetch_at, Duration::ZERO);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            match self.source.resubscribe() {
                                Some(rx) => {
                                    self.changes = rx;
                                    self.publish_connectivity(Connectivity::Connecting);
                                    Self::schedule(&mut refetch_at, Duration::ZERO);
                                }
                                None => {
                                    self.publish_connectivity(Connectivity::Error);
                                    break SyncExit::Disconnected;
                                }
                            }
                        }
                    }
                }

                peer = recv_peer(&mut self.lobby_peers) => {
                    if let Some(msg) = peer {
                        if let Some(exit) = self.note_peer(&msg) {
                            break exit;
                        }
                        if msg.event.implies_state_change() {
                            Self::schedule(&mut refetch_at, Duration::ZERO);
                        }
                    }
                }

                peer = recv_peer(&mut self.game_peers) => {
                    if let Some(msg) = peer {
                        if let Some(exit) = self.note_peer(&msg) {
                            break exit;
                        }
                        if msg.event.implies_state_change() {
                            Self::schedule(&mut refetch_at, Duration::ZERO);
                        }
                    }
                }

                _ = async {
                    match refetch_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    refetch_at = None;
                    match self.refetch().await {
                        FetchOutcome::Member => backoff = self.debounce,
                        FetchOutcome::NotMember => break SyncExit::Kicked,
                        FetchOutcome::Gone => {
                            tokio::time::sleep(self.exit_grace).await;
                            break SyncExit::SessionEnded;
                        }
                        FetchOutcome::Retry => {
                            Self::schedule(&mut refetch_at, backoff);
                            backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                        }
                    }
                }
            }
        };

        self.finish(exit)
    }

    /// Collapse bursts: an earlier pending deadline always wins
    fn schedule(refetch_at: &mut Option<Instant>, delay: Duration) {
        let at = Instant::now() + delay;
        *refetch_at = Some(match refetch_at {
            Some(existing) => (*existing).min(at),
            None => at,
        });
    }

    /// Broadcast payloads are hints only, with two exceptions that do not
    /// touch game state: the transient joining indicator, and a kick that
    /// names us (exit now instead of waiting for the fetch to notice).
    fn note_peer(&mut self, msg: &PeerMessage) -> Option<SyncExit> {
        match &msg.event {
            PeerEvent::PlayerJoined {
                customer_id,
                display_name,
            } => {
                if !self.announced.iter().any(|(id, _)| id == customer_id) {
                    self.announced
                        .push((customer_id.clone(), display_name.clone()));
                    let joining = self.joining_names(None);
                    self.updates.send_modify(|u| u.joining = joining);
                }
                None
            }
            PeerEvent::PlayerKicked { customer_id } if *customer_id == self.customer_id => {
                // Clear local session state entirely
                let _ = self.updates.send(SyncUpdate::initial());
                Some(SyncExit::Kicked)
            }
            _ => None,
        }
    }

    /// Announced names not yet confirmed by the given snapshot
    fn joining_names(&self, snapshot: Option<&LobbySnapshot>) -> Vec<String> {
        self.announced
            .iter()
            .filter(|(id, _)| {
                snapshot.is_none_or(|s| !s.players.iter().any(|p| &p.customer_id == id))
            })
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Fetch, derive, publish
    async fn refetch(&mut self) -> FetchOutcome {
        match self
            .source
            .fetch(&self.session_id, &self.customer_id)
            .await
        {
            Ok(snapshot) => {
                self.announced
                    .retain(|(id, _)| !snapshot.players.iter().any(|p| &p.customer_id == id));
                let member = snapshot
                    .players
                    .iter()
                    .any(|p| p.customer_id == self.customer_id);
                let phase = Phase::derive(&snapshot);
                let joining = self.joining_names(Some(&snapshot));
                let _ = self.updates.send(SyncUpdate {
                    snapshot: Some(snapshot),
                    phase: Some(phase),
                    connectivity: Connectivity::Subscribed,
                    joining,
                });
                if member {
                    FetchOutcome::Member
                } else {
                    FetchOutcome::NotMember
                }
            }
            Err(GameError::NotFound(_)) => FetchOutcome::Gone,
            Err(e) => {
                tracing::warn!("Snapshot fetch failed, will retry: {e}");
                self.publish_connectivity(Connectivity::Error);
                FetchOutcome::Retry
            }
        }
    }

    fn publish_connectivity(&self, connectivity: Connectivity) {
        self.updates.send_modify(|u| u.connectivity = connectivity);
    }

    fn finish(self, exit: SyncExit) -> SyncExit {
        tracing::info!(
            "Sync loop for {} in session {} exited: {exit:?}",
            self.customer_id,
            self.session_id
        );
        exit
    }
}

async fn recv_peer(rx: &mut broadcast::Receiver<PeerMessage>) -> Option<PeerMessage> {
    loop {
        match rx.recv().await {
            Ok(msg) => return Some(msg),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                // Peer channels are best effort; losing one is not fatal
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Wraps the store to count how many fetches the loop performs
    #[derive(Clone)]
    struct CountingSource {
        inner: AppState,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SnapshotSource for CountingSource {
        async fn fetch(&self, session_id: &str, customer_id: &str) -> GameResult<LobbySnapshot> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.get_lobby_data(session_id, customer_id).await
        }

        fn resubscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
            Some(self.inner.subscribe_changes())
        }
    }

    fn test_config() -> GameConfig {
        GameConfig {
            refetch_debounce: Duration::from_millis(50),
            deletion_grace: Duration::from_millis(0),
            ..GameConfig::default()
        }
    }

    async fn counted_client(
        state: &AppState,
        session_id: &str,
        customer_id: &str,
        config: &GameConfig,
    ) -> (
        LobbyClient<CountingSource>,
        watch::Receiver<SyncUpdate>,
        Arc<AtomicUsize>,
    ) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            inner: state.clone(),
            fetches: fetches.clone(),
        };
        let (client, rx) = LobbyClient::with_source(
            source,
            state.subscribe_changes(),
            state.subscribe_peers(session_id, PeerScope::Lobby).await,
            state.subscribe_peers(session_id, PeerScope::Game).await,
            session_id,
            customer_id,
            config,
        );
        (client, rx, fetches)
    }

    #[tokio::test]
    async fn test_burst_of_changes_collapses_to_one_fetch() {
        let state = AppState::default();
        let session = state.create_session("cust_1", "P1").await.unwrap();

        let (client, mut rx, fetches) =
            counted_client(&state, &session.id, "cust_1", &test_config()).await;
        let handle = tokio::spawn(client.run());

        // Wait for the initial converge
        rx.changed().await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        // Three rapid mutations inside one debounce window
        for i in 2..=4 {
            state
                .join(&session.lobby_code, &format!("P{i}"), Some(format!("cust_{i}")))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        let update = rx.borrow().clone();
        assert_eq!(update.snapshot.unwrap().players.len(), 4);
        assert_eq!(update.connectivity, Connectivity::Subscribed);

        handle.abort();
    }

    #[tokio::test]
    async fn test_kicked_player_exits_terminally() {
        let state = AppState::default();
        let session = state.create_session("cust_1", "P1").await.unwrap();
        state
            .join(&session.lobby_code, "P2", Some("cust_2".to_string()))
            .await
            .unwrap();

        let (client, _rx, _) =
            counted_client(&state, &session.id, "cust_2", &test_config()).await;
        let handle = tokio::spawn(client.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        state
            .kick_player(&session.id, "cust_2", "cust_1")
            .await
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, SyncExit::Kicked);
    }

    #[tokio::test]
    async fn test_kick_broadcast_naming_us_exits_immediately() {
        // Debounce long enough that only the broadcast path can explain a
        // quick exit
        let config = GameConfig {
            refetch_debounce: Duration::from_secs(10),
            deletion_grace: Duration::from_millis(0),
            ..GameConfig::default()
        };
        let state = AppState::default();
        let session = state.create_session("cust_1", "P1").await.unwrap();
        state
            .join(&session.lobby_code, "P2", Some("cust_2".to_string()))
            .await
            .unwrap();

        let (client, mut rx, _) = counted_client(&state, &session.id, "cust_2", &config).await;
        let handle = tokio::spawn(client.run());
        rx.changed().await.unwrap();

        state
            .send_peer(
                &session.id,
                PeerScope::Lobby,
                PeerMessage::new(
                    PeerEvent::PlayerKicked {
                        customer_id: "cust_2".to_string(),
                    },
                    "cust_1",
                    "P1",
                ),
            )
            .await;

        let exit = tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("broadcast kick should not wait for a fetch")
            .unwrap();
        assert_eq!(exit, SyncExit::Kicked);
        // Local session state was cleared on the way out
        assert!(rx.borrow().snapshot.is_none());
    }

    #[tokio::test]
    async fn test_session_deletion_ends_loop_after_grace() {
        let state = AppState::default();
        let session = state.create_session("cust_1", "P1").await.unwrap();
        state
            .join(&session.lobby_code, "P2", Some("cust_2".to_string()))
            .await
            .unwrap();

        let (client, _rx, _) =
            counted_client(&state, &session.id, "cust_2", &test_config()).await;
        let handle = tokio::spawn(client.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        state.end_lobby(&session.id, "cust_1").await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, SyncExit::SessionEnded);
    }

    #[tokio::test]
    async fn test_peer_hint_triggers_immediate_refetch() {
        let config = GameConfig {
            refetch_debounce: Duration::from_secs(10),
            deletion_grace: Duration::from_millis(0),
            ..GameConfig::default()
        };
        let state = AppState::default();
        let session = state.create_session("cust_1", "P1").await.unwrap();

        let (client, mut rx, fetches) =
            counted_client(&state, &session.id, "cust_1", &config).await;
        let handle = tokio::spawn(client.run());
        rx.changed().await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        state
            .send_peer(
                &session.id,
                PeerScope::Lobby,
                PeerMessage::new(PeerEvent::TurnOrderChanged, "cust_2", "P2"),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        handle.abort();
    }

    #[tokio::test]
    async fn test_joining_indicator_clears_once_persisted() {
        let config = GameConfig {
            refetch_debounce: Duration::from_millis(20),
            deletion_grace: Duration::from_millis(0),
            ..GameConfig::default()
        };
        let state = AppState::default();
        let session = state.create_session("cust_1", "P1").await.unwrap();

        let (client, mut rx, _) = counted_client(&state, &session.id, "cust_1", &config).await;
        let handle = tokio::spawn(client.run());
        rx.changed().await.unwrap();

        // Announced but not yet persisted: shows up as joining
        state
            .send_peer(
                &session.id,
                PeerScope::Lobby,
                PeerMessage::new(
                    PeerEvent::PlayerJoined {
                        customer_id: "cust_2".to_string(),
                        display_name: "Arlo".to_string(),
                    },
                    "cust_2",
                    "Arlo",
                ),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rx.borrow().joining, vec!["Arlo".to_string()]);

        // Once the row lands, the next fetch clears the indicator
        state
            .join(&session.lobby_code, "Arlo", Some("cust_2".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let update = rx.borrow().clone();
        assert!(update.joining.is_empty());
        assert_eq!(update.snapshot.unwrap().players.len(), 2);

        handle.abort();
    }

    #[tokio::test]
    async fn test_connect_against_missing_session_ends() {
        let state = AppState::new(test_config());
        let (client, _rx) = LobbyClient::connect(&state, "no_such_session", "cust_1").await;
        let exit = tokio::time::timeout(Duration::from_secs(2), client.run())
            .await
            .unwrap();
        assert_eq!(exit, SyncExit::SessionEnded);
    }
}
