//! Environment-driven configuration.

use std::time::Duration;

/// Hard ceiling for the AI-fallback deadline.
const MAX_HUMAN_SEARCH_TIMEOUT_MS: u64 = 180_000;

/// Tunables for the matchmaking engine and push dispatcher.
#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    /// AI-fallback deadline measured from start-search.
    pub human_search_timeout: Duration,
    /// Continuous-scan tick.
    pub search_interval: Duration,
    /// Attempts before considering early AI fallback on quiet rounds.
    pub min_search_attempts: u32,
    /// Skill window radius for opponent selection.
    pub skill_threshold: f64,
    /// Enqueue is rejected above this size.
    pub max_queue_size: usize,
    /// Dispatcher heartbeat tick.
    pub heartbeat_interval: Duration,
    /// Push sessions idle longer than this are dropped and marked "timeout".
    pub connection_timeout: Duration,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            human_search_timeout: Duration::from_millis(45_000),
            search_interval: Duration::from_millis(3_000),
            min_search_attempts: 10,
            skill_threshold: 1.5,
            max_queue_size: 1_000,
            heartbeat_interval: Duration::from_millis(30_000),
            connection_timeout: Duration::from_millis(60_000),
        }
    }
}

impl MatchmakingConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let human_search_timeout_ms = env_u64(
            "HUMAN_SEARCH_TIMEOUT_MS",
            defaults.human_search_timeout.as_millis() as u64,
        )
        .min(MAX_HUMAN_SEARCH_TIMEOUT_MS);

        Self {
            human_search_timeout: Duration::from_millis(human_search_timeout_ms),
            search_interval: Duration::from_millis(env_u64(
                "SEARCH_INTERVAL_MS",
                defaults.search_interval.as_millis() as u64,
            )),
            min_search_attempts: env_u64(
                "MIN_SEARCH_ATTEMPTS",
                defaults.min_search_attempts as u64,
            ) as u32,
            skill_threshold: env_f64("SKILL_MATCHING_THRESHOLD", defaults.skill_threshold),
            max_queue_size: env_u64("MAX_QUEUE_SIZE", defaults.max_queue_size as u64) as usize,
            heartbeat_interval: Duration::from_millis(env_u64(
                "HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval.as_millis() as u64,
            )),
            connection_timeout: Duration::from_millis(env_u64(
                "CONNECTION_TIMEOUT_MS",
                defaults.connection_timeout.as_millis() as u64,
            )),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}
