//! Matchmaking engine.
//!
//! Owns the per-participant search lifecycle: enqueue, an opportunistic
//! immediate pair attempt, a periodic re-scan, and a bounded-time AI
//! fallback. Pair-critical sections run under the per-round distributed
//! lock so concurrent attempts (including from other server instances)
//! are serialized. Match-found events leave through the [`MatchObserver`]
//! port; the engine never knows the transport.

pub mod selection;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ai;
use crate::config::MatchmakingConfig;
use crate::error::ServiceError;
use crate::lock::LockService;
use crate::models::{
    fallback_display_name, MatchKind, MatchRecord, MatchStatus, OpponentDescriptor,
    ParticipantStatus, PeerInfo, QueueEntry, TreatmentGroup,
};
use crate::persistence::{with_retry, PersistenceSink};
use crate::queue::{estimate_wait_seconds, EnqueueOutcome, QueueService};
use crate::status::{DailyStats, ParticipantRegistry};
use crate::store::{keys, SharedStore};

/// Round-lock TTL: bounds the stall from a crashed pair attempt.
const LOCK_TTL: Duration = Duration::from_secs(5);

/// Live match records auto-expire from the shared store.
const MATCH_TTL: Duration = Duration::from_secs(2 * 3_600);

/// Active searches older than this are purged by the cleanup pass.
const SEARCH_MAX_AGE_MINUTES: i64 = 10;

/// An entry younger than this counts as "someone is actually waiting" when
/// deciding on early AI fallback.
const RECENT_ENTRY_WINDOW_SECS: i64 = 300;

/// Round value meaning "whatever round the participant was searching in",
/// sent by the dispatcher on disconnect.
pub const ANY_ROUND: u32 = 0;

/// Narrow port through which the engine announces matches.
#[async_trait]
pub trait MatchObserver: Send + Sync {
    async fn match_found(&self, record: &MatchRecord);
}

/// A validated start-search request. Construction happens at the push
/// boundary; the engine trusts these fields.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub participant_id: String,
    pub participant_name: Option<String>,
    pub round_number: u32,
    pub skill_level: f64,
    pub treatment_group: TreatmentGroup,
}

#[derive(Debug)]
pub enum StartOutcome {
    /// A search is already running for this participant.
    AlreadySearching,
    /// The participant's status flipped to "matched" while we enqueued.
    AlreadyMatched { match_id: Option<String> },
    Matched(MatchRecord),
    Searching {
        queue_position: i64,
        estimated_wait_seconds: u64,
    },
}

struct ActiveSearch {
    participant_id: String,
    round_number: u32,
    started_at: DateTime<Utc>,
    attempts: AtomicU32,
    cancel: CancellationToken,
}

pub struct MatchmakingEngine {
    queues: QueueService,
    locks: LockService,
    registry: ParticipantRegistry,
    stats: DailyStats,
    store: SharedStore,
    sink: Arc<dyn PersistenceSink>,
    observer: Arc<dyn MatchObserver>,
    config: MatchmakingConfig,
    searches: DashMap<String, Arc<ActiveSearch>>,
}

impl MatchmakingEngine {
    pub fn new(
        store: SharedStore,
        sink: Arc<dyn PersistenceSink>,
        observer: Arc<dyn MatchObserver>,
        config: MatchmakingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queues: QueueService::new(store.clone(), config.max_queue_size),
            locks: LockService::new(store.clone()),
            registry: ParticipantRegistry::new(store.clone()),
            stats: DailyStats::new(store.clone()),
            store,
            sink,
            observer,
            config,
            searches: DashMap::new(),
        })
    }

    pub fn queues(&self) -> &QueueService {
        &self.queues
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &DailyStats {
        &self.stats
    }

    pub fn persistence(&self) -> &Arc<dyn PersistenceSink> {
        &self.sink
    }

    pub fn config(&self) -> &MatchmakingConfig {
        &self.config
    }

    pub fn active_search_count(&self) -> usize {
        self.searches.len()
    }

    // -- Start-search ---------------------------------------------------------

    pub async fn start_matchmaking(
        self: &Arc<Self>,
        request: StartRequest,
    ) -> Result<StartOutcome, ServiceError> {
        let participant_id = request.participant_id.clone();

        let search = match self.searches.entry(participant_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(participant_id = %participant_id, "Search already active");
                return Ok(StartOutcome::AlreadySearching);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let search = Arc::new(ActiveSearch {
                    participant_id: participant_id.clone(),
                    round_number: request.round_number,
                    started_at: Utc::now(),
                    attempts: AtomicU32::new(0),
                    cancel: CancellationToken::new(),
                });
                vacant.insert(search.clone());
                search
            }
        };

        metrics::counter!("matchmaking_searches_total", 1);
        info!(
            participant_id = %participant_id,
            round_number = request.round_number,
            skill_level = request.skill_level,
            "Matchmaking started"
        );

        match self.begin_search(&search, &request).await {
            Ok(outcome) => Ok(outcome),
            // A full queue is a client-visible rejection, not grounds for a
            // consolation AI match.
            Err(e @ ServiceError::QueueFull { .. }) => {
                self.finish_search(&participant_id);
                Err(e)
            }
            Err(e) => {
                warn!(
                    participant_id = %participant_id,
                    error = %e,
                    "Start-search failed, degrading to immediate AI match"
                );
                let entry = queue_entry_for(&request);
                let record = self.create_ai_match(&entry).await?;
                self.observer.match_found(&record).await;
                Ok(StartOutcome::Matched(record))
            }
        }
    }

    async fn begin_search(
        self: &Arc<Self>,
        search: &Arc<ActiveSearch>,
        request: &StartRequest,
    ) -> Result<StartOutcome, ServiceError> {
        let participant_id = &request.participant_id;
        let round_number = request.round_number;

        self.registry
            .set_searching(
                participant_id,
                round_number,
                request.skill_level,
                request.treatment_group,
            )
            .await?;

        // Defensive: clear any stale entry before inserting a fresh one so
        // the participant never appears twice.
        self.queues
            .remove_from_queue(round_number, participant_id)
            .await?;
        let entry = queue_entry_for(request);
        match self.queues.add_to_queue(&entry).await? {
            EnqueueOutcome::Added => {}
            EnqueueOutcome::RejectedAlreadyMatched => {
                self.finish_search(participant_id);
                let match_id = self.registry.get_match_id(participant_id).await?;
                return Ok(StartOutcome::AlreadyMatched { match_id });
            }
            EnqueueOutcome::RejectedQueueFull => {
                return Err(ServiceError::QueueFull { round_number });
            }
        }
        self.stats.record_queue_join().await;

        if let Some(record) = self.find_immediate_match(&entry).await? {
            self.finish_search(participant_id);
            self.observer.match_found(&record).await;
            return Ok(StartOutcome::Matched(record));
        }

        self.spawn_continuous_search(search.clone(), entry.clone());
        self.spawn_ai_fallback(search.clone(), entry);

        let queue_position = self
            .queues
            .get_queue_position(round_number, participant_id)
            .await
            .unwrap_or(-1);
        let total_waiting = self
            .queues
            .get_queue_size(round_number)
            .await
            .unwrap_or(0);
        Ok(StartOutcome::Searching {
            queue_position,
            estimated_wait_seconds: estimate_wait_seconds(
                total_waiting,
                self.config.human_search_timeout,
            ),
        })
    }

    // -- Cancellation and teardown --------------------------------------------

    /// Cancel an active search. `round_number` may be [`ANY_ROUND`], in which
    /// case the round recorded at start-search is used for the dequeue.
    pub async fn cancel_matchmaking(
        &self,
        participant_id: &str,
        round_number: u32,
    ) -> Result<(), ServiceError> {
        metrics::counter!("matchmaking_cancellations_total", 1);
        self.abort_search(
            participant_id,
            round_number,
            ParticipantStatus::Cancelled,
            true,
        )
        .await
    }

    /// The push session dropped; tear the search down and mark the
    /// participant disconnected.
    pub async fn handle_disconnect(&self, participant_id: &str) -> Result<(), ServiceError> {
        self.abort_search(
            participant_id,
            ANY_ROUND,
            ParticipantStatus::Disconnected,
            false,
        )
        .await
    }

    /// The session went stale past the heartbeat deadline.
    pub async fn handle_session_timeout(&self, participant_id: &str) -> Result<(), ServiceError> {
        self.abort_search(participant_id, ANY_ROUND, ParticipantStatus::Timeout, false)
            .await
    }

    async fn abort_search(
        &self,
        participant_id: &str,
        round_hint: u32,
        final_status: ParticipantStatus,
        preserve_matched: bool,
    ) -> Result<(), ServiceError> {
        let recorded_round = self
            .searches
            .remove(participant_id)
            .map(|(_, search)| {
                search.cancel.cancel();
                search.round_number
            });

        let round_number = if round_hint == ANY_ROUND {
            recorded_round
        } else {
            Some(round_hint)
        };
        if let Some(round_number) = round_number {
            if let Err(e) = self
                .queues
                .remove_from_queue(round_number, participant_id)
                .await
            {
                warn!(
                    participant_id,
                    round_number,
                    error = %e,
                    "Dequeue during search abort failed"
                );
            }
        }

        // A cancel that arrives after the pair completed must not clobber
        // the matched status; the match has already been announced.
        if preserve_matched
            && recorded_round.is_none()
            && self.registry.get_status(participant_id).await? == Some(ParticipantStatus::Matched)
        {
            debug!(participant_id, "Cancel after match completion, keeping status");
            return Ok(());
        }

        self.registry
            .set_status(participant_id, final_status, &[])
            .await?;
        info!(participant_id, status = final_status.as_str(), "Search ended");
        Ok(())
    }

    fn finish_search(&self, participant_id: &str) {
        if let Some((_, search)) = self.searches.remove(participant_id) {
            search.cancel.cancel();
        }
    }

    // -- Pairing --------------------------------------------------------------

    /// One pair attempt under the round lock. Returns `None` when the lock
    /// is contended or no candidate is available.
    pub async fn find_immediate_match(
        &self,
        me: &QueueEntry,
    ) -> Result<Option<MatchRecord>, ServiceError> {
        let lock_key = keys::round_lock(me.round_number);
        let owner_token = Uuid::new_v4().to_string();
        if !self.locks.acquire(&lock_key, &owner_token, LOCK_TTL).await? {
            // Another pair operation is in progress; the scanner retries.
            return Ok(None);
        }

        let result = self.pair_under_lock(me).await;

        if let Err(e) = self.locks.release(&lock_key, &owner_token).await {
            warn!(lock = %lock_key, error = %e, "Lock release failed, TTL will reclaim");
        }
        result
    }

    async fn pair_under_lock(
        &self,
        me: &QueueEntry,
    ) -> Result<Option<MatchRecord>, ServiceError> {
        let mut candidates = self
            .queues
            .get_queue_entries(me.round_number, Some(&me.participant_id))
            .await?;

        loop {
            let chosen = selection::select_within_window(
                me.skill_level,
                self.config.skill_threshold,
                &candidates,
                |c| c.skill_level,
            );
            let Some(idx) = chosen else {
                return Ok(None);
            };
            let candidate = candidates.remove(idx);

            // The entry may be stale: a cancel, disconnect, or competing
            // pair can land between the queue read and this check. Drop it
            // and look again; we still hold the round lock.
            let candidate_status = self
                .registry
                .get_status(&candidate.participant_id)
                .await?;
            if matches!(candidate_status, Some(status) if status != ParticipantStatus::Searching)
            {
                debug!(
                    participant_id = %candidate.participant_id,
                    status = candidate_status.map(|s| s.as_str()).unwrap_or("unknown"),
                    "Skipping stale queue entry"
                );
                let _ = self
                    .queues
                    .remove_from_queue(me.round_number, &candidate.participant_id)
                    .await;
                continue;
            }

            let record = self.create_human_match(me, &candidate).await?;
            return Ok(Some(record));
        }
    }

    async fn create_human_match(
        &self,
        a: &QueueEntry,
        b: &QueueEntry,
    ) -> Result<MatchRecord, ServiceError> {
        if a.participant_id == b.participant_id {
            error!(participant_id = %a.participant_id, "Self-match attempted");
            return Err(ServiceError::SelfMatch {
                participant_id: a.participant_id.clone(),
            });
        }

        // Mark both sides mid-pair so concurrent scanners back off.
        for participant_id in [&a.participant_id, &b.participant_id] {
            if let Err(e) = self
                .registry
                .set_status(participant_id, ParticipantStatus::Matching, &[])
                .await
            {
                warn!(participant_id = %participant_id, error = %e, "Failed to write matching status");
            }
        }

        match self.finalize_human_match(a, b).await {
            Ok(record) => Ok(record),
            Err(e) => {
                // Roll the transient status back so both sides keep
                // searching instead of hanging in "matching".
                for participant_id in [&a.participant_id, &b.participant_id] {
                    let _ = self
                        .registry
                        .set_status(participant_id, ParticipantStatus::Searching, &[])
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn finalize_human_match(
        &self,
        a: &QueueEntry,
        b: &QueueEntry,
    ) -> Result<MatchRecord, ServiceError> {
        let record = MatchRecord {
            id: Uuid::new_v4().to_string(),
            round_number: a.round_number,
            status: MatchStatus::Active,
            created_at: Utc::now(),
            kind: MatchKind::Human {
                participant1: PeerInfo {
                    participant_id: a.participant_id.clone(),
                    display_name: Some(self.resolve_display_name(a).await),
                    skill_level: a.skill_level,
                },
                participant2: PeerInfo {
                    participant_id: b.participant_id.clone(),
                    display_name: Some(self.resolve_display_name(b).await),
                    skill_level: b.skill_level,
                },
            },
        };

        self.write_match_record(&record).await?;
        self.mirror_create(&record);

        self.registry
            .set_matched(&a.participant_id, &record.id)
            .await?;
        self.registry
            .set_matched(&b.participant_id, &record.id)
            .await?;
        self.queues
            .remove_from_queue(a.round_number, &a.participant_id)
            .await?;
        self.queues
            .remove_from_queue(b.round_number, &b.participant_id)
            .await?;

        // If the opponent's search runs in this process, stop its scanner
        // and fallback timer before they can double-match.
        self.finish_search(&b.participant_id);

        self.stats.record_human_match().await;
        metrics::counter!("matchmaking_matches_total", 1, "kind" => "human");
        info!(
            match_id = %record.id,
            participant1_id = %a.participant_id,
            participant2_id = %b.participant_id,
            round_number = a.round_number,
            "Human match created"
        );
        Ok(record)
    }

    /// Create an AI match for a participant whose human search ended. Never
    /// fails outright: internal errors degrade to a canned fallback match.
    pub async fn create_ai_match(
        &self,
        me: &QueueEntry,
    ) -> Result<MatchRecord, ServiceError> {
        self.finish_search(&me.participant_id);
        if let Err(e) = self
            .queues
            .remove_from_queue(me.round_number, &me.participant_id)
            .await
        {
            warn!(participant_id = %me.participant_id, error = %e, "Dequeue before AI match failed");
        }

        // Another instance may have paired us while the fallback fired.
        if self.registry.get_status(&me.participant_id).await? == Some(ParticipantStatus::Matched)
        {
            return Err(ServiceError::Race {
                participant_id: me.participant_id.clone(),
                reason: "matched before AI fallback could run".to_string(),
            });
        }

        match self.build_and_store_ai_match(me).await {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(
                    participant_id = %me.participant_id,
                    error = %e,
                    "AI match creation failed, synthesizing fallback opponent"
                );
                let record = canned_ai_match(me);
                if let Ok(fields) = record.to_fields() {
                    let key = keys::match_record(&record.id);
                    let _ = self.store.hset(&key, &fields).await;
                    let _ = self.store.expire(&key, MATCH_TTL).await;
                }
                let _ = self
                    .registry
                    .set_matched(&me.participant_id, &record.id)
                    .await;
                Ok(record)
            }
        }
    }

    async fn build_and_store_ai_match(
        &self,
        me: &QueueEntry,
    ) -> Result<MatchRecord, ServiceError> {
        let display_name = self.resolve_display_name(me).await;
        let record = {
            let mut rng = rand::thread_rng();
            ai::build_ai_match(
                &me.participant_id,
                Some(&display_name),
                me.round_number,
                me.skill_level,
                self.config.skill_threshold,
                &mut rng,
            )
        };

        self.write_match_record(&record).await?;
        self.mirror_create(&record);
        self.registry
            .set_matched(&me.participant_id, &record.id)
            .await?;

        self.stats.record_ai_match().await;
        metrics::counter!("matchmaking_matches_total", 1, "kind" => "ai");
        info!(
            match_id = %record.id,
            participant_id = %me.participant_id,
            round_number = me.round_number,
            "AI match created"
        );
        Ok(record)
    }

    async fn write_match_record(&self, record: &MatchRecord) -> Result<(), ServiceError> {
        let key = keys::match_record(&record.id);
        self.store.hset(&key, &record.to_fields()?).await?;
        self.store.expire(&key, MATCH_TTL).await?;
        Ok(())
    }

    /// Queue-entry name, then the analytics profile, then the deterministic
    /// `Player <last-4>` placeholder.
    async fn resolve_display_name(&self, entry: &QueueEntry) -> String {
        if let Some(name) = &entry.participant_name {
            return name.clone();
        }
        match self.sink.get_participant(&entry.participant_id).await {
            Ok(Some(profile)) => profile
                .display_name
                .unwrap_or_else(|| fallback_display_name(&entry.participant_id)),
            Ok(None) => fallback_display_name(&entry.participant_id),
            Err(e) => {
                debug!(
                    participant_id = %entry.participant_id,
                    error = %e,
                    "Name lookup failed, using placeholder"
                );
                fallback_display_name(&entry.participant_id)
            }
        }
    }

    fn mirror_create(&self, record: &MatchRecord) {
        let sink = Arc::clone(&self.sink);
        let record = record.clone();
        tokio::spawn(async move {
            let result =
                with_retry("create_tournament_match", || {
                    sink.create_tournament_match(&record)
                })
                .await;
            if let Err(e) = result {
                warn!(
                    match_id = %record.id,
                    error = %e,
                    "Match mirror failed; shared store remains authoritative"
                );
            }
        });
    }

    // -- Match reads and updates ----------------------------------------------

    pub async fn get_match(&self, match_id: &str) -> Result<Option<MatchRecord>, ServiceError> {
        let fields = self.store.hgetall(&keys::match_record(match_id)).await?;
        MatchRecord::from_fields(&fields)
    }

    /// Flip a live match's status and mirror the update.
    pub async fn update_match_status(
        &self,
        match_id: &str,
        status: MatchStatus,
        extras: Option<serde_json::Value>,
    ) -> Result<Option<MatchRecord>, ServiceError> {
        let Some(mut record) = self.get_match(match_id).await? else {
            return Ok(None);
        };
        record.status = status;
        self.store
            .hset(
                &keys::match_record(match_id),
                &[("status".to_string(), status.as_str().to_string())],
            )
            .await?;

        let sink = Arc::clone(&self.sink);
        let match_id = match_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = sink.update_tournament_match(&match_id, status, extras).await {
                warn!(match_id = %match_id, error = %e, "Match status mirror failed");
            }
        });
        Ok(Some(record))
    }

    // -- Background search tasks ----------------------------------------------

    fn spawn_continuous_search(self: &Arc<Self>, search: Arc<ActiveSearch>, entry: QueueEntry) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(engine.config.search_interval);
            // The first tick completes immediately; consume it so scans
            // start one interval after the immediate attempt.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = search.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Some(record) = engine.scan_once(&search, &entry).await {
                    engine.observer.match_found(&record).await;
                    break;
                }
                if !engine.searches.contains_key(&search.participant_id) {
                    break;
                }
            }
            debug!(participant_id = %search.participant_id, "Continuous search stopped");
        });
    }

    /// One scanner tick. Returns a record when this tick produced a match
    /// (human or early-fallback AI).
    async fn scan_once(
        self: &Arc<Self>,
        search: &Arc<ActiveSearch>,
        entry: &QueueEntry,
    ) -> Option<MatchRecord> {
        let participant_id = search.participant_id.as_str();
        if !self.searches.contains_key(participant_id) {
            return None;
        }
        let attempt = search.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        match self.registry.get_status(participant_id).await {
            Ok(Some(status)) if status.is_settled() => {
                debug!(participant_id, status = status.as_str(), "Already settled, scanner exiting");
                self.finish_search(participant_id);
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(participant_id, error = %e, "Status read failed, will retry");
                return None;
            }
        }

        // Defensive: another instance may have written the match only to the
        // durable mirror before we saw the status flip.
        match self
            .sink
            .get_active_match_for_participant(participant_id, search.round_number)
            .await
        {
            Ok(Some(stored)) => {
                info!(participant_id, match_id = %stored.id, "Found existing active match, syncing");
                let _ = self.registry.set_matched(participant_id, &stored.id).await;
                self.finish_search(participant_id);
                return None;
            }
            Ok(None) => {}
            Err(e) => {
                debug!(participant_id, error = %e, "Active-match lookup failed");
            }
        }

        match self.find_immediate_match(entry).await {
            Ok(Some(record)) => {
                self.finish_search(participant_id);
                return Some(record);
            }
            Ok(None) => {}
            Err(ServiceError::SelfMatch { .. }) => {
                // Fatal for this attempt only; keep scanning.
                error!(participant_id, "Self-match detected during scan");
            }
            Err(e) => {
                warn!(participant_id, error = %e, "Pair attempt failed, will retry");
            }
        }

        if attempt >= self.config.min_search_attempts && self.round_is_quiet(entry).await {
            info!(
                participant_id,
                attempt, "Round is quiet after repeated scans, falling back to AI"
            );
            match self.create_ai_match(entry).await {
                Ok(record) => return Some(record),
                Err(e) => {
                    warn!(participant_id, error = %e, "Early AI fallback failed");
                }
            }
        }
        None
    }

    /// No other entry has joined the round queue recently.
    async fn round_is_quiet(&self, entry: &QueueEntry) -> bool {
        match self
            .queues
            .get_queue_entries(entry.round_number, Some(&entry.participant_id))
            .await
        {
            Ok(others) => {
                let now = Utc::now();
                !others
                    .iter()
                    .any(|e| e.age(now).num_seconds() < RECENT_ENTRY_WINDOW_SECS)
            }
            Err(_) => false,
        }
    }

    fn spawn_ai_fallback(self: &Arc<Self>, search: Arc<ActiveSearch>, entry: QueueEntry) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = search.cancel.cancelled() => return,
                _ = tokio::time::sleep(engine.config.human_search_timeout) => {}
            }
            // The record may have been cleared between the sleep elapsing
            // and this task running; the timer is then a no-op.
            if !engine.searches.contains_key(&search.participant_id) {
                return;
            }
            info!(
                participant_id = %search.participant_id,
                round_number = search.round_number,
                "Human search timed out, creating AI match"
            );
            match engine.create_ai_match(&entry).await {
                Ok(record) => engine.observer.match_found(&record).await,
                Err(e) => {
                    warn!(
                        participant_id = %search.participant_id,
                        error = %e,
                        "AI fallback did not produce a match"
                    );
                }
            }
        });
    }

    // -- Cleanup --------------------------------------------------------------

    /// Purge stale active searches and expired queue entries. Runs from the
    /// periodic cleanup job.
    pub async fn run_cleanup(&self) -> (u64, u64) {
        let cutoff = Utc::now() - chrono::Duration::minutes(SEARCH_MAX_AGE_MINUTES);
        let stale: Vec<String> = self
            .searches
            .iter()
            .filter(|entry| entry.value().started_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for participant_id in &stale {
            warn!(participant_id = %participant_id, "Purging stale active search");
            self.finish_search(participant_id);
        }

        let removed_entries = match self.queues.cleanup_expired_queues().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Queue cleanup failed");
                0
            }
        };
        (stale.len() as u64, removed_entries)
    }
}

fn queue_entry_for(request: &StartRequest) -> QueueEntry {
    QueueEntry::new(
        request.participant_id.clone(),
        request.participant_name.clone(),
        request.round_number,
        request.skill_level,
        request.treatment_group,
    )
}

/// Last-resort opponent used when even the simulator path fails.
fn canned_ai_match(me: &QueueEntry) -> MatchRecord {
    let settings = ai::AiSettings {
        opponent_id: "ai-opponent-fallback".to_string(),
        personality: ai::Personality::Collaborative,
        response_class: ai::ResponseClass::Medium,
        skill_level: me.skill_level,
    };
    MatchRecord {
        id: Uuid::new_v4().to_string(),
        round_number: me.round_number,
        status: MatchStatus::Active,
        created_at: Utc::now(),
        kind: MatchKind::Ai {
            participant1: PeerInfo {
                participant_id: me.participant_id.clone(),
                display_name: me.participant_name.clone(),
                skill_level: me.skill_level,
            },
            opponent: OpponentDescriptor {
                id: settings.opponent_id.clone(),
                display_name: "Jordan".to_string(),
                skill_level: me.skill_level,
                is_ai: true,
                personality: Some(settings.personality),
                response_class: Some(settings.response_class),
            },
            settings,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::NullSink;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;

    struct RecordingObserver {
        records: Mutex<Vec<MatchRecord>>,
    }

    impl RecordingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                records: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MatchObserver for RecordingObserver {
        async fn match_found(&self, record: &MatchRecord) {
            self.records.lock().push(record.clone());
        }
    }

    fn test_config() -> MatchmakingConfig {
        MatchmakingConfig {
            human_search_timeout: Duration::from_millis(300),
            search_interval: Duration::from_millis(50),
            ..MatchmakingConfig::default()
        }
    }

    fn request(id: &str, round: u32, skill: f64) -> StartRequest {
        StartRequest {
            participant_id: id.to_string(),
            participant_name: None,
            round_number: round,
            skill_level: skill,
            treatment_group: TreatmentGroup::Control,
        }
    }

    fn engine_with(
        observer: Arc<RecordingObserver>,
        config: MatchmakingConfig,
    ) -> Arc<MatchmakingEngine> {
        MatchmakingEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NullSink),
            observer,
            config,
        )
    }

    #[tokio::test]
    async fn second_start_is_idempotent() {
        let observer = RecordingObserver::new();
        let engine = engine_with(observer, test_config());

        let first = engine.start_matchmaking(request("p1", 1, 5.0)).await.unwrap();
        assert!(matches!(first, StartOutcome::Searching { .. }));

        let second = engine.start_matchmaking(request("p1", 1, 5.0)).await.unwrap();
        assert!(matches!(second, StartOutcome::AlreadySearching));

        // Still exactly one queue entry.
        assert_eq!(engine.queues().get_queue_size(1).await.unwrap(), 1);

        engine.cancel_matchmaking("p1", 1).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_clears_search_queue_and_status() {
        let observer = RecordingObserver::new();
        let engine = engine_with(observer.clone(), test_config());

        engine.start_matchmaking(request("p1", 2, 5.0)).await.unwrap();
        assert_eq!(engine.active_search_count(), 1);

        engine.cancel_matchmaking("p1", 2).await.unwrap();
        assert_eq!(engine.active_search_count(), 0);
        assert_eq!(engine.queues().get_queue_size(2).await.unwrap(), 0);
        assert_eq!(
            engine.registry().get_status("p1").await.unwrap(),
            Some(ParticipantStatus::Cancelled)
        );

        // The fallback timer must find nothing to do.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(observer.records.lock().is_empty());
    }

    #[tokio::test]
    async fn disconnect_uses_recorded_round_for_dequeue() {
        let observer = RecordingObserver::new();
        let engine = engine_with(observer, test_config());

        engine.start_matchmaking(request("p1", 4, 5.0)).await.unwrap();
        assert_eq!(engine.queues().get_queue_size(4).await.unwrap(), 1);

        // Disconnect passes no usable round; the engine falls back to the
        // round recorded at start-search.
        engine.handle_disconnect("p1").await.unwrap();
        assert_eq!(engine.queues().get_queue_size(4).await.unwrap(), 0);
        assert_eq!(
            engine.registry().get_status("p1").await.unwrap(),
            Some(ParticipantStatus::Disconnected)
        );
    }

    #[tokio::test]
    async fn stale_searches_are_purged_by_cleanup() {
        let observer = RecordingObserver::new();
        let engine = engine_with(observer, test_config());

        // Fabricate an old search record directly.
        engine.searches.insert(
            "p-old".to_string(),
            Arc::new(ActiveSearch {
                participant_id: "p-old".to_string(),
                round_number: 1,
                started_at: Utc::now() - chrono::Duration::minutes(11),
                attempts: AtomicU32::new(0),
                cancel: CancellationToken::new(),
            }),
        );

        let (purged, _) = engine.run_cleanup().await;
        assert_eq!(purged, 1);
        assert_eq!(engine.active_search_count(), 0);
    }

    #[tokio::test]
    async fn self_match_is_refused() {
        let observer = RecordingObserver::new();
        let engine = engine_with(observer, test_config());
        let entry = queue_entry_for(&request("p1", 1, 5.0));

        let result = engine.create_human_match(&entry, &entry).await;
        assert!(matches!(result, Err(ServiceError::SelfMatch { .. })));
    }
}
