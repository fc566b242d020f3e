//! Push-session registry and heartbeat.
//!
//! One session per participant id, carrying the outbound event channel and
//! liveness bookkeeping. A periodic sweep drops sessions that have gone
//! quiet past the connection timeout and broadcasts a heartbeat with the
//! connected count.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::ServerEvent;
use crate::engine::MatchmakingEngine;
use crate::models::TreatmentGroup;

pub struct Session {
    pub socket_id: String,
    pub round_number: Option<u32>,
    pub display_name: Option<String>,
    pub treatment_group: Option<TreatmentGroup>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace a participant's session. A re-register from a new
    /// socket supersedes the old session.
    pub fn upsert(
        &self,
        participant_id: &str,
        socket_id: &str,
        round_number: Option<u32>,
        display_name: Option<String>,
        treatment_group: Option<TreatmentGroup>,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let now = Utc::now();
        self.sessions.insert(
            participant_id.to_string(),
            Session {
                socket_id: socket_id.to_string(),
                round_number,
                display_name,
                treatment_group,
                connected_at: now,
                last_seen: now,
                sender,
            },
        );
        debug!(participant_id, socket_id, "Push session registered");
    }

    pub fn touch(&self, participant_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(participant_id) {
            session.last_seen = Utc::now();
        }
    }

    /// Remove the session only if it still belongs to the given socket, so
    /// the teardown of a superseded socket cannot kill its replacement.
    pub fn remove_if_socket(&self, participant_id: &str, socket_id: &str) -> bool {
        self.sessions
            .remove_if(participant_id, |_, session| session.socket_id == socket_id)
            .is_some()
    }

    pub fn remove(&self, participant_id: &str) -> bool {
        self.sessions.remove(participant_id).is_some()
    }

    /// Deliver an event to one participant. `false` when no live session
    /// exists (the participant may reconnect and recover via the store).
    pub fn send_to(&self, participant_id: &str, event: ServerEvent) -> bool {
        match self.sessions.get(participant_id) {
            Some(session) => session.sender.send(event).is_ok(),
            None => false,
        }
    }

    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for session in self.sessions.iter() {
            if session.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn display_name(&self, participant_id: &str) -> Option<String> {
        self.sessions
            .get(participant_id)
            .and_then(|s| s.display_name.clone())
    }

    pub fn stale_participants(&self, max_idle: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_idle).unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.sessions
            .iter()
            .filter(|entry| entry.value().last_seen < cutoff)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Periodic liveness sweep: stale sessions are dropped and marked
/// "timeout", their searches cancelled, and every remaining session gets a
/// heartbeat with the connected count.
pub async fn run_heartbeat_worker(sessions: Arc<SessionRegistry>, engine: Arc<MatchmakingEngine>) {
    let heartbeat_interval = engine.config().heartbeat_interval;
    let connection_timeout = engine.config().connection_timeout;
    let mut ticker = tokio::time::interval(heartbeat_interval);
    info!(
        interval_ms = heartbeat_interval.as_millis() as u64,
        timeout_ms = connection_timeout.as_millis() as u64,
        "Heartbeat worker started"
    );

    loop {
        ticker.tick().await;

        for participant_id in sessions.stale_participants(connection_timeout) {
            warn!(participant_id = %participant_id, "Dropping stale push session");
            sessions.remove(&participant_id);
            if let Err(e) = engine.handle_session_timeout(&participant_id).await {
                warn!(
                    participant_id = %participant_id,
                    error = %e,
                    "Session-timeout handling failed"
                );
            }
        }

        let connected = sessions.connected_count();
        metrics::gauge!("push_sessions_active", connected as f64);
        sessions.broadcast(&ServerEvent::Heartbeat {
            connected,
            timestamp: Utc::now().to_rfc3339(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (
        mpsc::UnboundedSender<ServerEvent>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn send_to_reaches_the_registered_session() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = channel();
        registry.upsert("p1", "sock-1", Some(1), None, None, tx);

        assert!(registry.send_to(
            "p1",
            ServerEvent::Pong {
                timestamp: Utc::now().to_rfc3339(),
            }
        ));
        assert!(matches!(rx.recv().await, Some(ServerEvent::Pong { .. })));
        assert!(!registry.send_to(
            "p2",
            ServerEvent::Pong {
                timestamp: Utc::now().to_rfc3339(),
            }
        ));
    }

    #[tokio::test]
    async fn superseded_socket_cannot_remove_replacement() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, mut rx2) = channel();
        registry.upsert("p1", "sock-1", None, None, None, tx1);
        registry.upsert("p1", "sock-2", None, None, None, tx2);

        // The old socket's teardown must be a no-op.
        assert!(!registry.remove_if_socket("p1", "sock-1"));
        assert!(registry.send_to(
            "p1",
            ServerEvent::Pong {
                timestamp: Utc::now().to_rfc3339(),
            }
        ));
        assert!(matches!(rx2.recv().await, Some(ServerEvent::Pong { .. })));

        assert!(registry.remove_if_socket("p1", "sock-2"));
        assert_eq!(registry.connected_count(), 0);
    }

    #[tokio::test]
    async fn stale_sessions_are_detected() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = channel();
        registry.upsert("p1", "sock-1", None, None, None, tx);

        assert!(registry
            .stale_participants(Duration::from_secs(60))
            .is_empty());

        // Backdate the session past the timeout.
        registry.sessions.get_mut("p1").unwrap().last_seen =
            Utc::now() - chrono::Duration::seconds(120);
        assert_eq!(
            registry.stale_participants(Duration::from_secs(60)),
            vec!["p1".to_string()]
        );
    }

    #[tokio::test]
    async fn broadcast_counts_deliveries() {
        let registry = SessionRegistry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        registry.upsert("p1", "sock-1", None, None, None, tx1);
        registry.upsert("p2", "sock-2", None, None, None, tx2);

        let delivered = registry.broadcast(&ServerEvent::Heartbeat {
            connected: 2,
            timestamp: Utc::now().to_rfc3339(),
        });
        assert_eq!(delivered, 2);
        assert!(matches!(rx1.recv().await, Some(ServerEvent::Heartbeat { .. })));
        assert!(matches!(rx2.recv().await, Some(ServerEvent::Heartbeat { .. })));
    }
}
