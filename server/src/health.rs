use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::{sync::Arc, time::SystemTime};

use crate::engine::MatchmakingEngine;
use crate::persistence::PersistenceSink;
use crate::realtime::SessionRegistry;
use crate::store::SharedStore;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: u64,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    store: CheckStatus,
    persistence: CheckStatus,
    matchmaking: MatchmakingHealth,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct MatchmakingHealth {
    /// Searches currently live in this process.
    active_searches: usize,
    /// Connected push sessions.
    connected_sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    store: bool,
    persistence: bool,
}

/// Liveness probe - checks if the application is running
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe. The shared store is load-bearing; the persistence sink
/// is best-effort and only reported, never gating.
pub async fn readiness(
    State(store): State<SharedStore>,
    State(sink): State<Arc<dyn PersistenceSink>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let store_ready = store.ping().await.is_ok();
    let persistence_ready = sink.healthy().await;

    let status = if store_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: store_ready,
            checks: ReadinessChecks {
                store: store_ready,
                persistence: persistence_ready,
            },
        }),
    )
}

/// Detailed health information.
pub async fn health(
    State(store): State<SharedStore>,
    State(sink): State<Arc<dyn PersistenceSink>>,
    State(engine): State<Arc<MatchmakingEngine>>,
    State(sessions): State<Arc<SessionRegistry>>,
) -> (StatusCode, Json<HealthResponse>) {
    let store_status = if store.ping().await.is_ok() {
        CheckStatus::Healthy
    } else {
        CheckStatus::Unhealthy
    };
    let persistence_status = if sink.healthy().await {
        CheckStatus::Healthy
    } else {
        CheckStatus::Unhealthy
    };

    let overall_healthy = matches!(store_status, CheckStatus::Healthy);
    let status = if overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let timestamp = match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs(),
        Err(_) => 0,
    };

    (
        status,
        Json(HealthResponse {
            status: if overall_healthy {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                store: store_status,
                persistence: persistence_status,
                matchmaking: MatchmakingHealth {
                    active_searches: engine.active_search_count(),
                    connected_sessions: sessions.connected_count(),
                },
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }
}
