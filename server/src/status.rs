//! Participant status registry and daily counters.

use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::models::{ParticipantStatus, TreatmentGroup};
use crate::store::{keys, SharedStore, StoreError};

/// Status hashes go stale after an hour; every write renews the TTL.
const STATUS_TTL: Duration = Duration::from_secs(3_600);

/// Daily counters are kept for a week.
const STATS_TTL: Duration = Duration::from_secs(7 * 24 * 3_600);

/// Writes and reads `participant:<id>:status` hashes. The engine, the
/// dispatcher (connect/disconnect/timeout), and admin actions all write
/// through here.
#[derive(Clone)]
pub struct ParticipantRegistry {
    store: SharedStore,
}

impl ParticipantRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn set_status(
        &self,
        participant_id: &str,
        status: ParticipantStatus,
        extra: &[(&str, String)],
    ) -> Result<(), StoreError> {
        let key = keys::participant_status(participant_id);
        let mut fields = vec![
            ("status".to_string(), status.as_str().to_string()),
            ("last_updated".to_string(), Utc::now().to_rfc3339()),
        ];
        for (name, value) in extra {
            fields.push((name.to_string(), value.clone()));
        }
        self.store.hset(&key, &fields).await?;
        self.store.expire(&key, STATUS_TTL).await
    }

    pub async fn set_searching(
        &self,
        participant_id: &str,
        round_number: u32,
        skill_level: f64,
        treatment_group: TreatmentGroup,
    ) -> Result<(), StoreError> {
        self.set_status(
            participant_id,
            ParticipantStatus::Searching,
            &[
                ("round_number", round_number.to_string()),
                ("skill_level", skill_level.to_string()),
                (
                    "treatment_group",
                    treatment_group.canonical().to_string(),
                ),
            ],
        )
        .await
    }

    pub async fn set_matched(
        &self,
        participant_id: &str,
        match_id: &str,
    ) -> Result<(), StoreError> {
        self.set_status(
            participant_id,
            ParticipantStatus::Matched,
            &[("match_id", match_id.to_string())],
        )
        .await
    }

    pub async fn get_status(
        &self,
        participant_id: &str,
    ) -> Result<Option<ParticipantStatus>, StoreError> {
        let key = keys::participant_status(participant_id);
        let fields = self.store.hgetall(&key).await?;
        Ok(fields.get("status").and_then(|s| ParticipantStatus::parse(s)))
    }

    pub async fn get_match_id(&self, participant_id: &str) -> Result<Option<String>, StoreError> {
        let key = keys::participant_status(participant_id);
        Ok(self.store.hgetall(&key).await?.remove("match_id"))
    }
}

/// Daily matchmaking counters under `stats:<YYYY-MM-DD>`. Increments are
/// best-effort; a failed counter bump never affects matchmaking.
#[derive(Clone)]
pub struct DailyStats {
    store: SharedStore,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub queue_joins: u64,
    pub human_matches: u64,
    pub ai_matches: u64,
}

impl DailyStats {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn record_queue_join(&self) {
        self.increment("queue_joins").await;
    }

    pub async fn record_human_match(&self) {
        self.increment("human_matches").await;
    }

    pub async fn record_ai_match(&self) {
        self.increment("ai_matches").await;
    }

    pub async fn today(&self) -> Result<StatsSnapshot, StoreError> {
        let key = keys::daily_stats(Utc::now().date_naive());
        let fields = self.store.hgetall(&key).await?;
        let read = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Ok(StatsSnapshot {
            queue_joins: read("queue_joins"),
            human_matches: read("human_matches"),
            ai_matches: read("ai_matches"),
        })
    }

    async fn increment(&self, counter: &str) {
        let key = keys::daily_stats(Utc::now().date_naive());
        let result = async {
            self.store.hincrby(&key, counter, 1).await?;
            self.store.expire(&key, STATS_TTL).await
        }
        .await;
        if let Err(e) = result {
            warn!(counter, error = %e, "Failed to bump daily counter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn status_round_trips() {
        let registry = ParticipantRegistry::new(Arc::new(MemoryStore::new()));
        assert_eq!(registry.get_status("p1").await.unwrap(), None);

        registry
            .set_searching("p1", 2, 7.0, TreatmentGroup::GoalSettingAi)
            .await
            .unwrap();
        assert_eq!(
            registry.get_status("p1").await.unwrap(),
            Some(ParticipantStatus::Searching)
        );

        registry.set_matched("p1", "match-1").await.unwrap();
        assert_eq!(
            registry.get_status("p1").await.unwrap(),
            Some(ParticipantStatus::Matched)
        );
        assert_eq!(
            registry.get_match_id("p1").await.unwrap().as_deref(),
            Some("match-1")
        );
    }

    #[tokio::test]
    async fn daily_counters_accumulate() {
        let stats = DailyStats::new(Arc::new(MemoryStore::new()));
        stats.record_queue_join().await;
        stats.record_queue_join().await;
        stats.record_human_match().await;
        stats.record_ai_match().await;

        let snapshot = stats.today().await.unwrap();
        assert_eq!(snapshot.queue_joins, 2);
        assert_eq!(snapshot.human_matches, 1);
        assert_eq!(snapshot.ai_matches, 1);
    }
}
