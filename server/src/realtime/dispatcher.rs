//! Push dispatcher: inbound event handling and match-found fanout.
//!
//! [`MatchAnnouncer`] is the engine's [`MatchObserver`]; it materializes a
//! per-peer view of each match (each side sees the *other* peer as the
//! opponent) and pushes it to the connected sessions. [`PushDispatcher`]
//! handles the client events arriving over the websocket, validating at the
//! boundary so invalid input never reaches the engine.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::{ClientEvent, MatchFoundPayload, MyRole, ServerEvent};
use super::sessions::SessionRegistry;
use crate::engine::{MatchObserver, MatchmakingEngine, StartOutcome, StartRequest};
use crate::error::ServiceError;
use crate::models::{
    fallback_display_name, MatchKind, MatchRecord, MatchStatus, OpponentDescriptor,
    ParticipantStatus, PeerInfo, TreatmentGroup,
};
use crate::queue::estimate_wait_seconds;
use crate::validation::{
    validate_id, validate_round, validate_skill, validate_treatment_group,
};

// ---------------------------------------------------------------------------
// Match-found fanout
// ---------------------------------------------------------------------------

pub struct MatchAnnouncer {
    sessions: Arc<SessionRegistry>,
}

impl MatchAnnouncer {
    pub fn new(sessions: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self { sessions })
    }

    /// Record name, then the live session's registered name, then the
    /// `Player <last-4>` placeholder.
    fn peer_display_name(&self, peer: &PeerInfo) -> String {
        peer.display_name
            .clone()
            .or_else(|| self.sessions.display_name(&peer.participant_id))
            .unwrap_or_else(|| fallback_display_name(&peer.participant_id))
    }

    fn deliver(&self, participant_id: &str, payload: MatchFoundPayload) {
        if !self
            .sessions
            .send_to(participant_id, ServerEvent::MatchFound(payload))
        {
            // Not fatal: the match record stays in the shared store and the
            // client can recover it after reconnecting.
            debug!(
                participant_id,
                "No live push session for match_found delivery"
            );
        }
    }
}

#[async_trait]
impl MatchObserver for MatchAnnouncer {
    async fn match_found(&self, record: &MatchRecord) {
        match &record.kind {
            MatchKind::Ai {
                participant1,
                opponent,
                settings,
            } => {
                let payload = match build_payload(
                    record,
                    MyRole::Participant1,
                    opponent,
                    Some(settings),
                ) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(match_id = %record.id, error = %e, "Failed to encode match payload");
                        return;
                    }
                };
                self.deliver(&participant1.participant_id, payload);
            }
            MatchKind::Human {
                participant1,
                participant2,
            } => {
                let views = [
                    (participant1, participant2, MyRole::Participant1),
                    (participant2, participant1, MyRole::Participant2),
                ];
                for (me, other, role) in views {
                    let opponent = OpponentDescriptor {
                        id: other.participant_id.clone(),
                        display_name: self.peer_display_name(other),
                        skill_level: other.skill_level,
                        is_ai: false,
                        personality: None,
                        response_class: None,
                    };
                    match build_payload(record, role, &opponent, None) {
                        Ok(payload) => self.deliver(&me.participant_id, payload),
                        Err(e) => {
                            warn!(match_id = %record.id, error = %e, "Failed to encode match payload");
                        }
                    }
                }
            }
        }
        info!(
            match_id = %record.id,
            is_ai = record.is_ai(),
            "Match announced"
        );
    }
}

fn build_payload(
    record: &MatchRecord,
    my_role: MyRole,
    opponent: &OpponentDescriptor,
    ai_settings: Option<&crate::ai::AiSettings>,
) -> Result<MatchFoundPayload, serde_json::Error> {
    Ok(MatchFoundPayload {
        id: record.id.clone(),
        participant1_id: record.participant1().participant_id.clone(),
        participant2_id: record.participant2_id().map(str::to_string),
        round_number: record.round_number,
        match_type: record.match_type().to_string(),
        status: record.status,
        created_at: record.created_at.to_rfc3339(),
        is_ai: record.is_ai(),
        opponent: serde_json::to_string(opponent)?,
        my_role,
        timestamp: Utc::now().to_rfc3339(),
        ai_settings: ai_settings
            .map(serde_json::to_string)
            .transpose()?,
    })
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

pub struct PushDispatcher {
    engine: Arc<MatchmakingEngine>,
    sessions: Arc<SessionRegistry>,
}

impl PushDispatcher {
    pub fn new(engine: Arc<MatchmakingEngine>, sessions: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self { engine, sessions })
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Handle one inbound event. `registered` tracks the participant bound
    /// to this socket; replies that predate registration go straight to the
    /// socket's outbound channel.
    pub async fn handle_event(
        &self,
        socket_id: &str,
        registered: &mut Option<String>,
        event: ClientEvent,
        reply: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        if let Some(participant_id) = registered.as_deref() {
            self.sessions.touch(participant_id);
        }

        match event {
            ClientEvent::Register {
                participant_id,
                round_number,
                participant_name,
                treatment_group,
            } => {
                self.handle_register(
                    socket_id,
                    registered,
                    participant_id,
                    round_number,
                    participant_name,
                    treatment_group,
                    reply,
                )
                .await;
            }
            ClientEvent::StartMatchmaking {
                participant_id,
                round_number,
                skill_level,
                treatment_group,
                participant_name,
            } => {
                self.handle_start(
                    participant_id,
                    round_number,
                    skill_level,
                    treatment_group,
                    participant_name,
                    reply,
                )
                .await;
            }
            ClientEvent::CancelMatchmaking {
                participant_id,
                round_number,
            } => {
                self.handle_cancel(participant_id, round_number, reply).await;
            }
            ClientEvent::GetQueueStatus { round_number } => {
                match validate_round(round_number) {
                    Ok(round) => match self.queue_status(round).await {
                        Ok(event) => send(reply, event),
                        Err(e) => {
                            warn!(round_number = round, error = %e, "Queue status read failed");
                            send(
                                reply,
                                ServerEvent::Error {
                                    message: "queue status unavailable".to_string(),
                                },
                            );
                        }
                    },
                    Err(e) => send_error(reply, e.to_string()),
                }
            }
            ClientEvent::MatchUpdate {
                match_id,
                update_type,
                update_data,
            } => {
                self.handle_match_update(match_id, update_type, update_data, reply)
                    .await;
            }
            ClientEvent::UpdateStatus {
                participant_id,
                status,
            } => {
                self.handle_update_status(participant_id, status, reply).await;
            }
            ClientEvent::Ping => {
                send(
                    reply,
                    ServerEvent::Pong {
                        timestamp: Utc::now().to_rfc3339(),
                    },
                );
            }
        }
    }

    /// The socket closed. Only the socket that owns the session tears it
    /// down; a superseded socket must not cancel its replacement's search.
    pub async fn handle_socket_closed(&self, participant_id: &str, socket_id: &str) {
        if !self.sessions.remove_if_socket(participant_id, socket_id) {
            debug!(participant_id, socket_id, "Socket was already superseded");
            return;
        }
        info!(participant_id, "Push session disconnected");
        if let Err(e) = self.engine.handle_disconnect(participant_id).await {
            warn!(participant_id, error = %e, "Disconnect handling failed");
        }
    }

    async fn handle_register(
        &self,
        socket_id: &str,
        registered: &mut Option<String>,
        participant_id: String,
        round_number: Option<i64>,
        participant_name: Option<String>,
        treatment_group: Option<String>,
        reply: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        if let Err(e) = validate_id(&participant_id) {
            send_error(reply, e.to_string());
            return;
        }
        let round = match round_number.map(validate_round).transpose() {
            Ok(round) => round,
            Err(e) => {
                send_error(reply, e.to_string());
                return;
            }
        };
        let group = match treatment_group
            .as_deref()
            .map(validate_treatment_group)
            .transpose()
        {
            Ok(group) => group,
            Err(e) => {
                send_error(reply, e.to_string());
                return;
            }
        };

        self.sessions.upsert(
            &participant_id,
            socket_id,
            round,
            participant_name,
            group,
            reply.clone(),
        );
        *registered = Some(participant_id.clone());

        send(
            reply,
            ServerEvent::RegistrationSuccess {
                participant_id: participant_id.clone(),
                socket_id: socket_id.to_string(),
                timestamp: Utc::now().to_rfc3339(),
            },
        );

        if let Some(round) = round {
            match self.queue_status(round).await {
                Ok(event) => send(reply, event),
                Err(e) => debug!(round_number = round, error = %e, "Queue status unavailable"),
            }
        }

        // Analytics breadcrumb, off the hot path.
        let sink = Arc::clone(self.engine.persistence());
        tokio::spawn(async move {
            if let Err(e) = sink.record_activity(&participant_id, "registered", None).await {
                debug!(error = %e, "Activity record failed");
            }
        });
    }

    async fn handle_start(
        &self,
        participant_id: String,
        round_number: i64,
        skill_level: Option<f64>,
        treatment_group: Option<String>,
        participant_name: Option<String>,
        reply: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        let request =
            match self
                .validated_start_request(
                    participant_id,
                    round_number,
                    skill_level,
                    treatment_group,
                    participant_name,
                )
                .await
            {
                Ok(request) => request,
                Err(e) => {
                    send(reply, ServerEvent::MatchmakingError { message: e.to_string() });
                    return;
                }
            };

        send(
            reply,
            ServerEvent::MatchmakingStarted {
                participant_id: request.participant_id.clone(),
                round_number: request.round_number,
                timestamp: Utc::now().to_rfc3339(),
            },
        );

        match self.engine.start_matchmaking(request).await {
            Ok(StartOutcome::Searching {
                queue_position,
                estimated_wait_seconds,
            }) => send(
                reply,
                ServerEvent::MatchmakingStatus {
                    status: "searching".to_string(),
                    queue_position: Some(queue_position),
                    estimated_wait_seconds: Some(estimated_wait_seconds),
                    match_id: None,
                },
            ),
            Ok(StartOutcome::AlreadySearching) => send(
                reply,
                ServerEvent::MatchmakingStatus {
                    status: "already_searching".to_string(),
                    queue_position: None,
                    estimated_wait_seconds: None,
                    match_id: None,
                },
            ),
            Ok(StartOutcome::AlreadyMatched { match_id }) => send(
                reply,
                ServerEvent::MatchmakingStatus {
                    status: "matched".to_string(),
                    queue_position: None,
                    estimated_wait_seconds: None,
                    match_id,
                },
            ),
            // The match_found push went out through the announcer already.
            Ok(StartOutcome::Matched(record)) => send(
                reply,
                ServerEvent::MatchmakingStatus {
                    status: "match_found".to_string(),
                    queue_position: None,
                    estimated_wait_seconds: None,
                    match_id: Some(record.id),
                },
            ),
            Err(e) => {
                warn!(error = %e, "Start-search failed");
                send(
                    reply,
                    ServerEvent::MatchmakingError {
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    async fn validated_start_request(
        &self,
        participant_id: String,
        round_number: i64,
        skill_level: Option<f64>,
        treatment_group: Option<String>,
        participant_name: Option<String>,
    ) -> Result<StartRequest, ServiceError> {
        validate_id(&participant_id)?;
        let round_number = validate_round(round_number)?;
        let treatment_group = match treatment_group.as_deref() {
            Some(raw) => validate_treatment_group(raw)?,
            None => TreatmentGroup::Control,
        };
        let skill_level = match skill_level {
            Some(raw) => validate_skill(raw)?,
            // No skill supplied: derive one from recorded performance.
            None => match self.engine.persistence().get_participant_stats(&participant_id).await
            {
                Ok(Some(stats)) => stats.skill_level(),
                Ok(None) => 5.0,
                Err(e) => {
                    debug!(error = %e, "Stats lookup failed, using neutral skill");
                    5.0
                }
            },
        };
        Ok(StartRequest {
            participant_id,
            participant_name,
            round_number,
            skill_level,
            treatment_group,
        })
    }

    async fn handle_cancel(
        &self,
        participant_id: String,
        round_number: i64,
        reply: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        if let Err(e) = validate_id(&participant_id) {
            send_error(reply, e.to_string());
            return;
        }
        let round = match validate_round(round_number) {
            Ok(round) => round,
            Err(e) => {
                send_error(reply, e.to_string());
                return;
            }
        };

        match self.engine.cancel_matchmaking(&participant_id, round).await {
            Ok(()) => send(
                reply,
                ServerEvent::MatchmakingCancelled {
                    participant_id,
                    round_number: round,
                    timestamp: Utc::now().to_rfc3339(),
                },
            ),
            Err(e) => {
                warn!(participant_id = %participant_id, error = %e, "Cancel failed");
                send(
                    reply,
                    ServerEvent::MatchmakingError {
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    async fn handle_match_update(
        &self,
        match_id: String,
        update_type: String,
        update_data: Option<serde_json::Value>,
        reply: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        if let Err(e) = validate_id(&match_id) {
            send_error(reply, e.to_string());
            return;
        }

        let record = match self.engine.get_match(&match_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                send_error(reply, format!("match {match_id} not found"));
                return;
            }
            Err(e) => {
                warn!(match_id = %match_id, error = %e, "Match lookup failed");
                send_error(reply, "match lookup failed".to_string());
                return;
            }
        };

        // Status-bearing updates mutate the live record; anything else is a
        // pass-through broadcast between the peers.
        let record = match MatchStatus::parse(&update_type) {
            Some(status) => match self
                .engine
                .update_match_status(&match_id, status, update_data.clone())
                .await
            {
                Ok(Some(updated)) => updated,
                Ok(None) => record,
                Err(e) => {
                    warn!(match_id = %match_id, error = %e, "Match status update failed");
                    record
                }
            },
            None => record,
        };

        let event = ServerEvent::MatchUpdate {
            match_id: match_id.clone(),
            update_type,
            data: update_data,
            timestamp: Utc::now().to_rfc3339(),
        };
        // Both peers of a human match; just the sole human of an AI match.
        for participant_id in record.human_participant_ids() {
            self.sessions.send_to(participant_id, event.clone());
        }
    }

    async fn handle_update_status(
        &self,
        participant_id: String,
        status: String,
        reply: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        if let Err(e) = validate_id(&participant_id) {
            send_error(reply, e.to_string());
            return;
        }
        let Some(parsed) = ParticipantStatus::parse(&status) else {
            send_error(reply, format!("unknown status '{status}'"));
            return;
        };

        match self
            .engine
            .registry()
            .set_status(&participant_id, parsed, &[])
            .await
        {
            Ok(()) => send(
                reply,
                ServerEvent::StatusUpdated {
                    participant_id,
                    status,
                    timestamp: Utc::now().to_rfc3339(),
                },
            ),
            Err(e) => {
                warn!(participant_id = %participant_id, error = %e, "Status write failed");
                send_error(reply, "status update failed".to_string());
            }
        }
    }

    /// Live queue snapshot for one round.
    pub async fn queue_status(&self, round_number: u32) -> Result<ServerEvent, ServiceError> {
        let entries = self
            .engine
            .queues()
            .get_queue_entries(round_number, None)
            .await?;
        let total_waiting = entries.len() as u64;

        let now = Utc::now();
        let average_wait_time = if entries.is_empty() {
            0
        } else {
            let total_secs: i64 = entries
                .iter()
                .map(|e| e.age(now).num_seconds().max(0))
                .sum();
            (total_secs / entries.len() as i64) as u64
        };

        let stats = self.engine.stats().today().await.unwrap_or_default();
        Ok(ServerEvent::QueueStatusUpdate {
            round_number,
            total_waiting,
            average_wait_time,
            recent_matches: stats.human_matches + stats.ai_matches,
            estimated_wait_time: estimate_wait_seconds(
                total_waiting,
                self.engine.config().human_search_timeout,
            ),
        })
    }
}

fn send(reply: &mpsc::UnboundedSender<ServerEvent>, event: ServerEvent) {
    let _ = reply.send(event);
}

fn send_error(reply: &mpsc::UnboundedSender<ServerEvent>, message: String) {
    send(reply, ServerEvent::Error { message });
}
