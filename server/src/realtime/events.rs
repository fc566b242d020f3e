//! Push-channel wire protocol.
//!
//! Both directions are JSON text frames: an internally-tagged `type` field
//! selects the event, payload fields are camelCase. The `match_found`
//! payload mirrors the stored match record plus the per-peer `myRole` and
//! opponent view.

use serde::{Deserialize, Serialize};

use crate::models::MatchStatus;

/// Client -> server events.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Register {
        participant_id: String,
        #[serde(default)]
        round_number: Option<i64>,
        #[serde(default)]
        participant_name: Option<String>,
        #[serde(default)]
        treatment_group: Option<String>,
    },
    StartMatchmaking {
        participant_id: String,
        round_number: i64,
        #[serde(default)]
        skill_level: Option<f64>,
        #[serde(default)]
        treatment_group: Option<String>,
        #[serde(default)]
        participant_name: Option<String>,
    },
    CancelMatchmaking {
        participant_id: String,
        round_number: i64,
    },
    GetQueueStatus {
        round_number: i64,
    },
    MatchUpdate {
        match_id: String,
        update_type: String,
        #[serde(default)]
        update_data: Option<serde_json::Value>,
    },
    UpdateStatus {
        participant_id: String,
        status: String,
    },
    Ping,
}

/// Which seat of the match the receiving peer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MyRole {
    #[serde(rename = "participant1")]
    Participant1,
    #[serde(rename = "participant2")]
    Participant2,
}

/// The `match_found` payload. Field casing follows the established wire
/// contract: snake_case record fields with camelCase `isAI`/`myRole`/
/// `aiSettings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchFoundPayload {
    pub id: String,
    pub participant1_id: String,
    /// `null` for AI matches.
    pub participant2_id: Option<String>,
    pub round_number: u32,
    pub match_type: String,
    pub status: MatchStatus,
    pub created_at: String,
    #[serde(rename = "isAI")]
    pub is_ai: bool,
    /// JSON-encoded opponent descriptor, from the receiver's perspective.
    pub opponent: String,
    #[serde(rename = "myRole")]
    pub my_role: MyRole,
    pub timestamp: String,
    #[serde(
        rename = "aiSettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ai_settings: Option<String>,
}

/// Server -> client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    RegistrationSuccess {
        participant_id: String,
        socket_id: String,
        timestamp: String,
    },
    MatchmakingStarted {
        participant_id: String,
        round_number: u32,
        timestamp: String,
    },
    MatchmakingStatus {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        queue_position: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_wait_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        match_id: Option<String>,
    },
    MatchFound(MatchFoundPayload),
    MatchUpdate {
        match_id: String,
        update_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        timestamp: String,
    },
    QueueStatusUpdate {
        round_number: u32,
        total_waiting: u64,
        /// Seconds the current queue members have been waiting, averaged.
        average_wait_time: u64,
        /// Matches produced today (human + AI).
        recent_matches: u64,
        estimated_wait_time: u64,
    },
    StatusUpdated {
        participant_id: String,
        status: String,
        timestamp: String,
    },
    MatchmakingCancelled {
        participant_id: String,
        round_number: u32,
        timestamp: String,
    },
    MatchmakingError {
        message: String,
    },
    Error {
        message: String,
    },
    Heartbeat {
        connected: usize,
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_matchmaking_parses_camel_case_payload() {
        let json = r#"{
            "type": "start_matchmaking",
            "participantId": "00000000-0000-4000-8000-000000000001",
            "roundNumber": 3,
            "skillLevel": 7.5,
            "treatmentGroup": "goal_ai"
        }"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::StartMatchmaking {
                participant_id,
                round_number,
                skill_level,
                treatment_group,
                participant_name,
            } => {
                assert_eq!(participant_id, "00000000-0000-4000-8000-000000000001");
                assert_eq!(round_number, 3);
                assert_eq!(skill_level, Some(7.5));
                assert_eq!(treatment_group.as_deref(), Some("goal_ai"));
                assert_eq!(participant_name, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_fail_to_parse() {
        let json = r#"{"type": "self_destruct"}"#;
        assert!(serde_json::from_str::<ClientEvent>(json).is_err());
    }

    #[test]
    fn match_found_serializes_the_wire_contract() {
        let event = ServerEvent::MatchFound(MatchFoundPayload {
            id: "m1".to_string(),
            participant1_id: "p1".to_string(),
            participant2_id: None,
            round_number: 2,
            match_type: "human-vs-ai".to_string(),
            status: MatchStatus::Active,
            created_at: "2026-02-07T12:00:00Z".to_string(),
            is_ai: true,
            opponent: "{\"id\":\"ai-opponent-5\"}".to_string(),
            my_role: MyRole::Participant1,
            timestamp: "2026-02-07T12:00:00Z".to_string(),
            ai_settings: Some("{}".to_string()),
        });

        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(value["type"], "match_found");
        assert_eq!(value["isAI"], true);
        assert_eq!(value["myRole"], "participant1");
        assert_eq!(value["participant2_id"], serde_json::Value::Null);
        assert_eq!(value["status"], "active");
        // The opponent descriptor stays a JSON string on the wire.
        assert!(value["opponent"].is_string());
        assert!(value["aiSettings"].is_string());
    }

    #[test]
    fn queue_status_uses_camel_case_fields() {
        let event = ServerEvent::QueueStatusUpdate {
            round_number: 1,
            total_waiting: 4,
            average_wait_time: 12,
            recent_matches: 9,
            estimated_wait_time: 10,
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(value["type"], "queue_status_update");
        assert_eq!(value["roundNumber"], 1);
        assert_eq!(value["totalWaiting"], 4);
        assert_eq!(value["averageWaitTime"], 12);
        assert_eq!(value["recentMatches"], 9);
        assert_eq!(value["estimatedWaitTime"], 10);
    }
}
