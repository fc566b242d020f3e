//! Best-effort analytics mirror.
//!
//! The shared store is authoritative for live match state; everything here
//! is a durable mirror for downstream analytics. Engine-side calls are
//! wrapped so persistence failures never abort a pair.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};

use crate::models::{MatchRecord, MatchStatus};

/// A mirrored match row.
#[derive(Debug, Clone, FromRow)]
pub struct StoredMatch {
    pub id: String,
    pub participant1_id: String,
    pub participant2_id: Option<String>,
    pub round_number: i32,
    pub match_type: String,
    pub status: String,
    pub is_ai: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ParticipantProfile {
    pub id: String,
    pub display_name: Option<String>,
}

/// Aggregate performance for a participant, used to derive a skill level
/// when the client does not supply one.
#[derive(Debug, Clone, FromRow)]
pub struct ParticipantStats {
    pub participant_id: String,
    pub rounds_played: i64,
    pub avg_accuracy: Option<f64>,
}

impl ParticipantStats {
    /// Map mean accuracy in [0, 1] onto the 1-10 skill scale.
    pub fn skill_level(&self) -> f64 {
        match self.avg_accuracy {
            Some(accuracy) => (1.0 + accuracy * 9.0).clamp(1.0, 10.0),
            None => 5.0,
        }
    }
}

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Idempotent upsert keyed on the match id.
    async fn create_tournament_match(&self, record: &MatchRecord) -> Result<()>;

    async fn update_tournament_match(
        &self,
        match_id: &str,
        status: MatchStatus,
        extras: Option<Value>,
    ) -> Result<()>;

    /// Most recent active match for (participant, round), if any. Warns when
    /// more than one is active, which indicates a missed status update.
    async fn get_active_match_for_participant(
        &self,
        participant_id: &str,
        round_number: u32,
    ) -> Result<Option<StoredMatch>>;

    async fn get_participant(&self, participant_id: &str) -> Result<Option<ParticipantProfile>>;

    async fn get_participant_stats(
        &self,
        participant_id: &str,
    ) -> Result<Option<ParticipantStats>>;

    async fn record_activity(
        &self,
        participant_id: &str,
        activity_type: &str,
        payload: Option<Value>,
    ) -> Result<()>;

    async fn record_match_result(
        &self,
        match_id: &str,
        participant_id: &str,
        score: i64,
        accuracy: f64,
    ) -> Result<()>;

    async fn get_match_history(
        &self,
        participant_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredMatch>>;

    fn sink_name(&self) -> &'static str;

    /// Liveness for readiness probes.
    async fn healthy(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

pub const RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Run an operation with exponential backoff (3 attempts, base 1 s). Used
/// for the critical mirror writes; the final error is returned for the
/// caller to log and swallow.
pub async fn with_retry<T, F, Fut>(op_name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(op_name, RETRY_ATTEMPTS, RETRY_BASE_DELAY, operation).await
}

async fn retry_with<T, F, Fut>(
    op_name: &str,
    attempts: u32,
    base_delay: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base_delay;
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(
                    operation = op_name,
                    attempt,
                    error = %e,
                    "Persistence write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Postgres sink
// ---------------------------------------------------------------------------

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DbConfig {
    pub fn from_env(database_url: String) -> Self {
        Self {
            database_url,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub async fn connect(config: DbConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to analytics database")?;
        info!("Analytics database initialized");
        Ok(Self { pool })
    }
}

#[async_trait]
impl PersistenceSink for PgSink {
    async fn create_tournament_match(&self, record: &MatchRecord) -> Result<()> {
        let opponent = serde_json::to_value(record.opponent_for_participant1())?;
        sqlx::query(
            r#"
            INSERT INTO tournament_matches
                (id, participant1_id, participant2_id, round_number, match_type,
                 status, is_ai, opponent, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT (id) DO UPDATE
                SET status = EXCLUDED.status, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.participant1().participant_id)
        .bind(record.participant2_id())
        .bind(record.round_number as i32)
        .bind(record.match_type())
        .bind(record.status.as_str())
        .bind(record.is_ai())
        .bind(opponent)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to mirror tournament match")?;
        Ok(())
    }

    async fn update_tournament_match(
        &self,
        match_id: &str,
        status: MatchStatus,
        extras: Option<Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tournament_matches
            SET status = $2, extras = COALESCE($3, extras), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(match_id)
        .bind(status.as_str())
        .bind(extras)
        .execute(&self.pool)
        .await
        .context("Failed to update tournament match")?;
        Ok(())
    }

    async fn get_active_match_for_participant(
        &self,
        participant_id: &str,
        round_number: u32,
    ) -> Result<Option<StoredMatch>> {
        let matches = sqlx::query_as::<_, StoredMatch>(
            r#"
            SELECT id, participant1_id, participant2_id, round_number,
                   match_type, status, is_ai, created_at
            FROM tournament_matches
            WHERE (participant1_id = $1 OR participant2_id = $1)
              AND round_number = $2
              AND status IN ('active', 'paused')
            ORDER BY created_at DESC
            "#,
        )
        .bind(participant_id)
        .bind(round_number as i32)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query active matches")?;

        if matches.len() > 1 {
            warn!(
                participant_id,
                round_number,
                active_count = matches.len(),
                "Participant has multiple active matches for one round"
            );
        }
        Ok(matches.into_iter().next())
    }

    async fn get_participant(&self, participant_id: &str) -> Result<Option<ParticipantProfile>> {
        let profile = sqlx::query_as::<_, ParticipantProfile>(
            "SELECT id, display_name FROM participants WHERE id = $1",
        )
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch participant")?;
        Ok(profile)
    }

    async fn get_participant_stats(
        &self,
        participant_id: &str,
    ) -> Result<Option<ParticipantStats>> {
        let stats = sqlx::query_as::<_, ParticipantStats>(
            r#"
            SELECT participant_id, COUNT(*) AS rounds_played,
                   AVG(accuracy) AS avg_accuracy
            FROM match_results
            WHERE participant_id = $1
            GROUP BY participant_id
            "#,
        )
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch participant stats")?;
        Ok(stats)
    }

    async fn record_activity(
        &self,
        participant_id: &str,
        activity_type: &str,
        payload: Option<Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (participant_id, activity_type, payload, created_at)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(participant_id)
        .bind(activity_type)
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("Failed to record activity")?;
        Ok(())
    }

    async fn record_match_result(
        &self,
        match_id: &str,
        participant_id: &str,
        score: i64,
        accuracy: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO match_results (match_id, participant_id, score, accuracy, recorded_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (match_id, participant_id) DO UPDATE
                SET score = EXCLUDED.score, accuracy = EXCLUDED.accuracy,
                    recorded_at = EXCLUDED.recorded_at
            "#,
        )
        .bind(match_id)
        .bind(participant_id)
        .bind(score)
        .bind(accuracy)
        .execute(&self.pool)
        .await
        .context("Failed to record match result")?;
        Ok(())
    }

    async fn get_match_history(
        &self,
        participant_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredMatch>> {
        let matches = sqlx::query_as::<_, StoredMatch>(
            r#"
            SELECT id, participant1_id, participant2_id, round_number,
                   match_type, status, is_ai, created_at
            FROM tournament_matches
            WHERE participant1_id = $1 OR participant2_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(participant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch match history")?;
        Ok(matches)
    }

    fn sink_name(&self) -> &'static str {
        "postgres"
    }

    async fn healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

// ---------------------------------------------------------------------------
// Null sink
// ---------------------------------------------------------------------------

/// Sink for deployments running without an analytics database. Live state
/// in the shared store is authoritative either way.
pub struct NullSink;

#[async_trait]
impl PersistenceSink for NullSink {
    async fn create_tournament_match(&self, _record: &MatchRecord) -> Result<()> {
        Ok(())
    }

    async fn update_tournament_match(
        &self,
        _match_id: &str,
        _status: MatchStatus,
        _extras: Option<Value>,
    ) -> Result<()> {
        Ok(())
    }

    async fn get_active_match_for_participant(
        &self,
        _participant_id: &str,
        _round_number: u32,
    ) -> Result<Option<StoredMatch>> {
        Ok(None)
    }

    async fn get_participant(&self, _participant_id: &str) -> Result<Option<ParticipantProfile>> {
        Ok(None)
    }

    async fn get_participant_stats(
        &self,
        _participant_id: &str,
    ) -> Result<Option<ParticipantStats>> {
        Ok(None)
    }

    async fn record_activity(
        &self,
        _participant_id: &str,
        _activity_type: &str,
        _payload: Option<Value>,
    ) -> Result<()> {
        Ok(())
    }

    async fn record_match_result(
        &self,
        _match_id: &str,
        _participant_id: &str,
        _score: i64,
        _accuracy: f64,
    ) -> Result<()> {
        Ok(())
    }

    async fn get_match_history(
        &self,
        _participant_id: &str,
        _limit: i64,
    ) -> Result<Vec<StoredMatch>> {
        Ok(Vec::new())
    }

    fn sink_name(&self) -> &'static str {
        "null"
    }

    async fn healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry_with("test_op", 3, Duration::from_millis(2), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    anyhow::bail!("transient failure {n}")
                }
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with("test_op", 3, Duration::from_millis(2), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("permanent failure") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn null_sink_accepts_everything() {
        let sink = NullSink;
        assert!(sink.healthy().await);
        assert!(sink
            .get_active_match_for_participant("p1", 1)
            .await
            .unwrap()
            .is_none());
        assert!(sink.get_match_history("p1", 10).await.unwrap().is_empty());
    }

    #[test]
    fn stats_map_accuracy_onto_skill_scale() {
        let stats = ParticipantStats {
            participant_id: "p1".to_string(),
            rounds_played: 4,
            avg_accuracy: Some(0.5),
        };
        assert!((stats.skill_level() - 5.5).abs() < 1e-9);

        let empty = ParticipantStats {
            participant_id: "p2".to_string(),
            rounds_played: 0,
            avg_accuracy: None,
        };
        assert_eq!(empty.skill_level(), 5.0);
    }
}
