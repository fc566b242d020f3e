//! Domain models for queues, matches, and participant state.
//!
//! Match records live in the shared store as all-string hashes; the typed
//! representations here serialize at that boundary and coerce back on read
//! (including the string-to-bool `is_ai` coercion).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ai::{AiSettings, Personality, ResponseClass};
use crate::error::ServiceError;

// =============================================================================
// Participant status
// =============================================================================

/// Lifecycle status of a participant, stored under `participant:<id>:status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Searching,
    /// Transient: a pair attempt is mid-flight for this participant.
    Matching,
    Matched,
    Cancelled,
    Disconnected,
    Timeout,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Searching => "searching",
            Self::Matching => "matching",
            Self::Matched => "matched",
            Self::Cancelled => "cancelled",
            Self::Disconnected => "disconnected",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "searching" => Some(Self::Searching),
            "matching" => Some(Self::Matching),
            "matched" => Some(Self::Matched),
            "cancelled" => Some(Self::Cancelled),
            "disconnected" => Some(Self::Disconnected),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// A pair attempt must not touch participants in these states.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Matching | Self::Matched)
    }
}

// =============================================================================
// Treatment groups
// =============================================================================

/// Experimental-condition label attached to each participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreatmentGroup {
    Control,
    GoalSettingOnly,
    GoalSettingAi,
    GoalSettingAiCompetition,
    GoalSettingAiBlindCompetition,
}

impl TreatmentGroup {
    /// Canonical long-form label used on the wire and in storage.
    pub fn canonical(&self) -> &'static str {
        match self {
            Self::Control => "Group 1: Control",
            Self::GoalSettingOnly => "Group 2: Goal Setting Only",
            Self::GoalSettingAi => "Group 3: Goal Setting + AI Assistant",
            Self::GoalSettingAiCompetition => "Group 4: Goal Setting + AI Assistant + Competition",
            Self::GoalSettingAiBlindCompetition => {
                "Group 5: Goal Setting + AI Assistant + Blind Competition"
            }
        }
    }

    /// Accepts the long-form labels and the short aliases; anything else is
    /// rejected.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Group 1: Control" | "control" => Some(Self::Control),
            "Group 2: Goal Setting Only" | "goal_setting" => Some(Self::GoalSettingOnly),
            "Group 3: Goal Setting + AI Assistant" | "goal_ai" => Some(Self::GoalSettingAi),
            "Group 4: Goal Setting + AI Assistant + Competition" | "tournament" => {
                Some(Self::GoalSettingAiCompetition)
            }
            "Group 5: Goal Setting + AI Assistant + Blind Competition" => {
                Some(Self::GoalSettingAiBlindCompetition)
            }
            _ => None,
        }
    }
}

// =============================================================================
// Queue entries
// =============================================================================

/// A participant waiting in a round queue. Serialized as the sorted-set
/// member; the set score (join timestamp, epoch millis) is the FIFO key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_name: Option<String>,
    pub round_number: u32,
    pub skill_level: f64,
    pub treatment_group: TreatmentGroup,
    /// Epoch millis; duplicated into the sorted-set score.
    pub joined_at: i64,
    pub status: String,
}

impl QueueEntry {
    pub fn new(
        participant_id: String,
        participant_name: Option<String>,
        round_number: u32,
        skill_level: f64,
        treatment_group: TreatmentGroup,
    ) -> Self {
        Self {
            participant_id,
            participant_name,
            round_number,
            skill_level,
            treatment_group,
            joined_at: Utc::now().timestamp_millis(),
            status: "waiting".to_string(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - DateTime::from_timestamp_millis(self.joined_at).unwrap_or(now)
    }
}

// =============================================================================
// Matches
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Active,
    Completed,
    Cancelled,
    Paused,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

/// One side of a match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub skill_level: f64,
}

impl PeerInfo {
    /// Registered name, or a deterministic placeholder derived from the id.
    pub fn name_or_placeholder(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| fallback_display_name(&self.participant_id))
    }
}

/// Opponent view serialized into match records and `match_found` payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpponentDescriptor {
    pub id: String,
    pub display_name: String,
    pub skill_level: f64,
    pub is_ai: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<Personality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_class: Option<ResponseClass>,
}

impl OpponentDescriptor {
    pub fn human(peer: &PeerInfo) -> Self {
        Self {
            id: peer.participant_id.clone(),
            display_name: peer.name_or_placeholder(),
            skill_level: peer.skill_level,
            is_ai: false,
            personality: None,
            response_class: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MatchKind {
    Human {
        participant1: PeerInfo,
        participant2: PeerInfo,
    },
    Ai {
        participant1: PeerInfo,
        opponent: OpponentDescriptor,
        settings: AiSettings,
    },
}

/// A live match, authoritative in the shared store under `match:<id>`.
#[derive(Debug, Clone)]
pub struct MatchRecord {
    pub id: String,
    pub round_number: u32,
    pub status: MatchStatus,
    pub created_at: DateTime<Utc>,
    pub kind: MatchKind,
}

impl MatchRecord {
    pub fn is_ai(&self) -> bool {
        matches!(self.kind, MatchKind::Ai { .. })
    }

    pub fn match_type(&self) -> &'static str {
        match self.kind {
            MatchKind::Human { .. } => "live-human",
            MatchKind::Ai { .. } => "human-vs-ai",
        }
    }

    pub fn participant1(&self) -> &PeerInfo {
        match &self.kind {
            MatchKind::Human { participant1, .. } | MatchKind::Ai { participant1, .. } => {
                participant1
            }
        }
    }

    pub fn participant2_id(&self) -> Option<&str> {
        match &self.kind {
            MatchKind::Human { participant2, .. } => Some(&participant2.participant_id),
            MatchKind::Ai { .. } => None,
        }
    }

    /// Ids of the human participants (one for AI matches, two for human).
    pub fn human_participant_ids(&self) -> Vec<&str> {
        match &self.kind {
            MatchKind::Human {
                participant1,
                participant2,
            } => vec![
                participant1.participant_id.as_str(),
                participant2.participant_id.as_str(),
            ],
            MatchKind::Ai { participant1, .. } => vec![participant1.participant_id.as_str()],
        }
    }

    /// The opponent descriptor as seen by participant1.
    pub fn opponent_for_participant1(&self) -> OpponentDescriptor {
        match &self.kind {
            MatchKind::Human { participant2, .. } => OpponentDescriptor::human(participant2),
            MatchKind::Ai { opponent, .. } => opponent.clone(),
        }
    }

    /// Flatten to the all-string field list stored in the match hash.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>, ServiceError> {
        let mut fields = vec![
            ("id".to_string(), self.id.clone()),
            (
                "round_number".to_string(),
                self.round_number.to_string(),
            ),
            ("match_type".to_string(), self.match_type().to_string()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("created_at".to_string(), self.created_at.to_rfc3339()),
            ("is_ai".to_string(), self.is_ai().to_string()),
            (
                "opponent".to_string(),
                serde_json::to_string(&self.opponent_for_participant1())?,
            ),
        ];

        let p1 = self.participant1();
        fields.push(("participant1_id".to_string(), p1.participant_id.clone()));
        fields.push((
            "participant1_skill".to_string(),
            p1.skill_level.to_string(),
        ));
        if let Some(name) = &p1.display_name {
            fields.push(("participant1_name".to_string(), name.clone()));
        }

        match &self.kind {
            MatchKind::Human { participant2, .. } => {
                fields.push((
                    "participant2_id".to_string(),
                    participant2.participant_id.clone(),
                ));
                fields.push((
                    "participant2_skill".to_string(),
                    participant2.skill_level.to_string(),
                ));
                if let Some(name) = &participant2.display_name {
                    fields.push(("participant2_name".to_string(), name.clone()));
                }
            }
            MatchKind::Ai { settings, .. } => {
                fields.push((
                    "ai_settings".to_string(),
                    serde_json::to_string(settings)?,
                ));
            }
        }

        Ok(fields)
    }

    /// Rebuild a record from the stored hash. Missing hashes yield `None`;
    /// malformed ones are an error.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Option<Self>, ServiceError> {
        if fields.is_empty() {
            return Ok(None);
        }

        let get = |name: &str| -> Result<&str, ServiceError> {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| ServiceError::Persistence(format!("match hash missing {name}")))
        };

        let id = get("id")?.to_string();
        let round_number = get("round_number")?.parse::<u32>().map_err(|_| {
            ServiceError::Persistence(format!("match {id} has a malformed round number"))
        })?;
        let status = MatchStatus::parse(get("status")?)
            .ok_or_else(|| ServiceError::Persistence(format!("match {id} has unknown status")))?;
        let created_at = DateTime::parse_from_rfc3339(get("created_at")?)
            .map_err(|_| {
                ServiceError::Persistence(format!("match {id} has a malformed created_at"))
            })?
            .with_timezone(&Utc);

        // The store hands everything back as strings.
        let is_ai = coerce_bool(get("is_ai")?);

        let participant1 = PeerInfo {
            participant_id: get("participant1_id")?.to_string(),
            display_name: fields.get("participant1_name").cloned(),
            skill_level: fields
                .get("participant1_skill")
                .and_then(|s| s.parse().ok())
                .unwrap_or(5.0),
        };

        let kind = if is_ai {
            let opponent: OpponentDescriptor = serde_json::from_str(get("opponent")?)?;
            let settings: AiSettings = serde_json::from_str(get("ai_settings")?)?;
            MatchKind::Ai {
                participant1,
                opponent,
                settings,
            }
        } else {
            let participant2 = PeerInfo {
                participant_id: get("participant2_id")?.to_string(),
                display_name: fields.get("participant2_name").cloned(),
                skill_level: fields
                    .get("participant2_skill")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5.0),
            };
            MatchKind::Human {
                participant1,
                participant2,
            }
        };

        Ok(Some(Self {
            id,
            round_number,
            status,
            created_at,
            kind,
        }))
    }
}

/// `Player <last-4-of-id>`, the deterministic stand-in for unnamed peers.
pub fn fallback_display_name(participant_id: &str) -> String {
    let tail_start = participant_id
        .len()
        .saturating_sub(4);
    format!("Player {}", &participant_id[tail_start..])
}

fn coerce_bool(value: &str) -> bool {
    matches!(value, "true" | "TRUE" | "True" | "1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai;

    fn human_record() -> MatchRecord {
        MatchRecord {
            id: "7a9f6c1e-2f4b-4c3a-9d1e-0b2a4c6e8f01".to_string(),
            round_number: 3,
            status: MatchStatus::Active,
            created_at: Utc::now(),
            kind: MatchKind::Human {
                participant1: PeerInfo {
                    participant_id: "00000000-0000-4000-8000-000000000001".to_string(),
                    display_name: Some("Ada".to_string()),
                    skill_level: 7.0,
                },
                participant2: PeerInfo {
                    participant_id: "00000000-0000-4000-8000-000000000002".to_string(),
                    display_name: None,
                    skill_level: 7.5,
                },
            },
        }
    }

    #[test]
    fn human_record_round_trips_through_fields() {
        let record = human_record();
        let fields: HashMap<String, String> = record.to_fields().unwrap().into_iter().collect();
        let parsed = MatchRecord::from_fields(&fields).unwrap().unwrap();

        assert_eq!(parsed.id, record.id);
        assert_eq!(parsed.round_number, 3);
        assert!(!parsed.is_ai());
        assert_eq!(
            parsed.participant1().participant_id,
            record.participant1().participant_id
        );
        assert_eq!(
            parsed.participant2_id(),
            Some("00000000-0000-4000-8000-000000000002")
        );
    }

    #[test]
    fn ai_record_round_trips_through_fields() {
        let mut rng = rand::thread_rng();
        let record = ai::build_ai_match(
            "00000000-0000-4000-8000-000000000001",
            Some("Ada"),
            2,
            7.0,
            1.5,
            &mut rng,
        );
        let fields: HashMap<String, String> = record.to_fields().unwrap().into_iter().collect();
        let parsed = MatchRecord::from_fields(&fields).unwrap().unwrap();

        assert!(parsed.is_ai());
        assert_eq!(parsed.match_type(), "human-vs-ai");
        assert_eq!(parsed.participant2_id(), None);
        assert_eq!(parsed.human_participant_ids().len(), 1);
    }

    #[test]
    fn is_ai_survives_string_coercion() {
        let record = human_record();
        let mut fields: HashMap<String, String> =
            record.to_fields().unwrap().into_iter().collect();
        fields.insert("is_ai".to_string(), "false".to_string());
        assert!(!MatchRecord::from_fields(&fields).unwrap().unwrap().is_ai());

        // "1" must parse as true even though the writer uses "true".
        let ai_fields: HashMap<String, String> = {
            let mut rng = rand::thread_rng();
            let record = ai::build_ai_match(
                "00000000-0000-4000-8000-000000000001",
                None,
                1,
                6.0,
                1.5,
                &mut rng,
            );
            let mut f: HashMap<String, String> =
                record.to_fields().unwrap().into_iter().collect();
            f.insert("is_ai".to_string(), "1".to_string());
            f
        };
        assert!(MatchRecord::from_fields(&ai_fields).unwrap().unwrap().is_ai());
    }

    #[test]
    fn treatment_group_accepts_long_forms_and_aliases() {
        assert_eq!(
            TreatmentGroup::parse("Group 1: Control"),
            Some(TreatmentGroup::Control)
        );
        assert_eq!(
            TreatmentGroup::parse("goal_setting"),
            Some(TreatmentGroup::GoalSettingOnly)
        );
        assert_eq!(
            TreatmentGroup::parse("goal_ai"),
            Some(TreatmentGroup::GoalSettingAi)
        );
        assert_eq!(
            TreatmentGroup::parse("tournament"),
            Some(TreatmentGroup::GoalSettingAiCompetition)
        );
        assert_eq!(
            TreatmentGroup::parse("Group 5: Goal Setting + AI Assistant + Blind Competition"),
            Some(TreatmentGroup::GoalSettingAiBlindCompetition)
        );
        assert_eq!(TreatmentGroup::parse("group_6"), None);
        assert_eq!(TreatmentGroup::parse(""), None);
    }

    #[test]
    fn fallback_name_uses_last_four_chars() {
        assert_eq!(
            fallback_display_name("00000000-0000-4000-8000-00000000abcd"),
            "Player abcd"
        );
        assert_eq!(fallback_display_name("ab"), "Player ab");
    }
}
