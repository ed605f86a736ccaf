// =============================================================================
// BOOKING SERVICE - Main Entry Point
// =============================================================================
// Seat and waitlist allocation for scheduled transport.
//
// WHAT THIS SERVICE DOES:
// - Confirms bookings against a schedule's fixed seat capacity, assigning
//   concrete seats, or queues them on a prioritised waitlist
// - Cancels bookings with a time-tiered refund and promotes waitlisted
//   bookings into the freed seats
// - Serves coach layouts, waitlist positions and per-quota fares
// - Exposes Prometheus metrics; caches layouts in Redis when configured
// =============================================================================

// -----------------------------------------------------------------------------
// MODULE DECLARATIONS
// -----------------------------------------------------------------------------
mod allocator;   // Booking allocation engine (allocator.rs)
mod config;      // Configuration loading (config.rs)
mod db;          // PostgreSQL store (db.rs)
mod error;       // Error types (error.rs)
mod handlers;    // HTTP request handlers (handlers.rs)
mod identity;    // Caller identity extractor (identity.rs)
mod inventory;   // Per-schedule seat counters (inventory.rs)
mod layout_cache; // Coach layout cache (layout_cache.rs)
mod metrics;     // Prometheus metrics setup (metrics.rs)
mod models;      // Data structures (models.rs)
mod notifier;    // Booking notifications (notifier.rs)
mod promotion;   // Cancellation and waitlist promotion (promotion.rs)
mod seats;       // Seat map and assignment (seats.rs)
mod store;       // Store traits and in-memory store (store.rs)
mod waitlist;    // Waitlist queue (waitlist.rs)

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::allocator::BookingAllocator;
use crate::config::Config;
use crate::db::Database;
use crate::layout_cache::RedisLayoutCache;
use crate::metrics::setup_metrics;
use crate::notifier::{LogNotifier, Notifier, RedisNotifier};
use crate::store::{BookingStore, Catalog, MemoryStore};

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
pub struct AppState {
    /// Owns every schedule's allocation state
    pub allocator: Arc<BookingAllocator>,

    /// Same store the allocator commits to; used for readiness
    pub store: Arc<dyn BookingStore>,

    /// Used for readiness; `None` when REDIS_URL is unset
    pub redis: Option<redis::aio::ConnectionManager>,

    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// How often idle departed schedules are dropped from memory.
const EVICTION_INTERVAL: Duration = Duration::from_secs(300);

// -----------------------------------------------------------------------------
// MAIN FUNCTION
// -----------------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok(); // .env is optional

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // Example: RUST_LOG=info,booking_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,booking_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Booking Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        port = config.port,
        database = config.database_url.is_some(),
        redis = config.redis_url.is_some(),
        "Configuration loaded"
    );

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Choose the store
    // -------------------------------------------------------------------------
    let (store, catalog): (Arc<dyn BookingStore>, Arc<dyn Catalog>) = match &config.database_url {
        Some(url) => {
            let db = Arc::new(Database::connect(url).await?);
            info!("Connected to PostgreSQL");
            db.run_migrations().await?;
            info!("Database migrations completed");
            let store: Arc<dyn BookingStore> = db.clone();
            let catalog: Arc<dyn Catalog> = db;
            (store, catalog)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store with sample schedules");
            let memory = Arc::new(MemoryStore::seeded().await?);
            let store: Arc<dyn BookingStore> = memory.clone();
            let catalog: Arc<dyn Catalog> = memory;
            (store, catalog)
        }
    };

    // -------------------------------------------------------------------------
    // STEP 6: Connect to Redis
    // -------------------------------------------------------------------------
    // ConnectionManager reconnects on its own
    let redis = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            info!("Connected to Redis");
            Some(conn)
        }
        None => None,
    };

    let notifier: Arc<dyn Notifier> = match &redis {
        Some(conn) => Arc::new(RedisNotifier::new(conn.clone())),
        None => Arc::new(LogNotifier),
    };

    // -------------------------------------------------------------------------
    // STEP 7: Create application state
    // -------------------------------------------------------------------------
    let mut allocator = BookingAllocator::new(
        store.clone(),
        catalog,
        notifier,
        config.allocation_policy(),
    );
    if let Some(conn) = &redis {
        allocator = allocator.with_layout_cache(Arc::new(RedisLayoutCache::new(
            conn.clone(),
            config.layout_cache_ttl_secs,
        )));
    }
    let allocator = Arc::new(allocator);

    let sweeper = Arc::clone(&allocator);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
        loop {
            ticker.tick().await;
            match sweeper.evict_idle(chrono::Utc::now()) {
                Ok(0) => {}
                Ok(evicted) => info!(evicted, "Evicted idle schedules"),
                Err(e) => warn!(error = %e, "Schedule eviction failed"),
            }
        }
    });

    let state = Arc::new(AppState {
        allocator,
        store,
        redis,
        metrics_handle,
    });

    // -------------------------------------------------------------------------
    // STEP 8: Define routes
    // -------------------------------------------------------------------------
    let app = Router::new()
        // ----- Health & Readiness Endpoints -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        // ----- Metrics Endpoint -----
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Booking API Endpoints -----
        .route("/api/v1/bookings", post(handlers::create_booking))
        .route("/api/v1/bookings/:booking_id", get(handlers::get_booking))
        .route("/api/v1/bookings/:booking_id/cancel", post(handlers::cancel_booking))
        .route(
            "/api/v1/bookings/:booking_id/waitlist",
            get(handlers::booking_waitlist_position),
        )
        // ----- Schedule API Endpoints -----
        .route(
            "/api/v1/schedules/:schedule_id/waitlist",
            get(handlers::schedule_waitlist_position),
        )
        .route("/api/v1/schedules/:schedule_id/layout", get(handlers::coach_layout))
        .route("/api/v1/schedules/:schedule_id/fares", get(handlers::fare_quote))
        // ----- Middleware Layers -----
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // -------------------------------------------------------------------------
    // STEP 9: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Booking Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
