use axum::{
    extract::FromRef,
    routing::get,
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pairline_server::{
    config::MatchmakingConfig,
    engine::MatchmakingEngine,
    health, jobs, metrics,
    persistence::{DbConfig, NullSink, PersistenceSink, PgSink},
    realtime::{self, MatchAnnouncer, PushDispatcher, SessionRegistry},
    store::{MemoryStore, RedisStore, SharedStore},
};

// Composite state for Axum
#[derive(Clone, FromRef)]
struct AppState {
    store: SharedStore,
    sink: Arc<dyn PersistenceSink>,
    engine: Arc<MatchmakingEngine>,
    sessions: Arc<SessionRegistry>,
    dispatcher: Arc<PushDispatcher>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing with production-safe defaults
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }

        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Pairline matchmaking server");

    let config = MatchmakingConfig::from_env();
    tracing::info!(
        human_search_timeout_ms = config.human_search_timeout.as_millis() as u64,
        search_interval_ms = config.search_interval.as_millis() as u64,
        skill_threshold = config.skill_threshold,
        max_queue_size = config.max_queue_size,
        "Matchmaking configuration loaded"
    );

    // Initialize metrics
    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("Metrics initialized");

    // Shared store: Redis when configured, otherwise the in-process store
    // (fine for a single instance; the distributed lock still applies).
    let store: SharedStore = match std::env::var("REDIS_URL") {
        Ok(url) => Arc::new(RedisStore::connect(&url).await?),
        Err(_) => {
            tracing::warn!("REDIS_URL not set; using in-process store (single instance only)");
            Arc::new(MemoryStore::new())
        }
    };
    tracing::info!(backend = store.backend_name(), "Shared store initialized");

    // Analytics mirror: best-effort, never load-bearing.
    let sink: Arc<dyn PersistenceSink> = match std::env::var("DATABASE_URL") {
        Ok(url) => Arc::new(PgSink::connect(DbConfig::from_env(url)).await?),
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; match mirroring disabled");
            Arc::new(NullSink)
        }
    };
    tracing::info!(sink = sink.sink_name(), "Persistence sink initialized");

    // Push sessions and the match-found fanout port.
    let sessions = SessionRegistry::new();
    let announcer = MatchAnnouncer::new(sessions.clone());

    let engine = MatchmakingEngine::new(store.clone(), sink.clone(), announcer, config);
    tracing::info!("Matchmaking engine initialized");

    let dispatcher = PushDispatcher::new(engine.clone(), sessions.clone());

    // Spawn matchmaking cleanup worker
    tokio::spawn(jobs::run_cleanup_worker(engine.clone()));
    tracing::info!("Cleanup worker started");

    // Spawn session heartbeat worker
    tokio::spawn(realtime::run_heartbeat_worker(sessions.clone(), engine.clone()));
    tracing::info!("Heartbeat worker started");

    // Create composite app state
    let app_state = AppState {
        store,
        sink,
        engine,
        sessions,
        dispatcher,
    };

    // Only expose metrics when explicitly enabled
    let metrics_router = if matches!(
        std::env::var("ENABLE_METRICS").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    ) {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    let app = Router::new()
        // Health check endpoints
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        // Bidirectional push channel
        .route("/ws", get(realtime::websocket::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
        .merge(metrics_router);

    let port = std::env::var("SERVER_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
