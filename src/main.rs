//! Meeting Voting Backend
//!
//! REST backend for PIN-protected meetings and their time-boxed votings, with
//! SQLite persistence and a push-based change stream.

mod api;
mod auth;
mod config;
mod db;
mod errors;
mod events;
mod expiry;
mod models;
mod report;
mod tally;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{Config, LogFormat};
use db::Repository;
use events::BroadcastFeed;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    tracing::info!("Starting Meeting Voting Backend");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Bind address: {}", config.bind_addr);

    // Warn if PSK is not configured
    if config.api_psk.is_none() {
        tracing::warn!("No API PSK configured (MEETVOTE_API_PSK). Authentication is disabled!");
    }

    // Initialize database
    let pool = db::init_database(&config.db_path).await?;
    let repo = Arc::new(Repository::new(pool, Arc::new(BroadcastFeed::new())));

    if let Some(period) = config.expiry_sweep {
        tokio::spawn(expiry::run_sweeper(repo.clone(), period));
    }

    // Create application state
    let state = AppState {
        repo,
        config: Arc::new(config.clone()),
    };

    // Build router
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Clone PSK for the auth layer
    let psk = state.config.api_psk.clone();

    // API routes
    let api_routes = Router::new()
        // Meetings
        .route(
            "/meetings",
            get(api::list_meetings).post(api::create_meeting),
        )
        .route("/meetings/join", post(api::join_meeting))
        .route(
            "/meetings/{id}",
            get(api::get_meeting)
                .put(api::update_meeting)
                .delete(api::delete_meeting),
        )
        .route("/meetings/{id}/archive", post(api::archive_meeting))
        .route("/meetings/{id}/restore", post(api::restore_meeting))
        .route("/meetings/{id}/participants", get(api::list_participants))
        // Change stream
        .route("/meetings/{id}/events", get(api::meeting_events))
        // Reports
        .route("/meetings/{id}/report", get(api::meeting_report))
        .route("/meetings/{id}/report/csv", get(api::meeting_report_csv))
        // Votings
        .route(
            "/meetings/{id}/votings",
            get(api::list_votings).post(api::create_voting),
        )
        .route(
            "/meetings/{id}/votings/{voting_id}",
            get(api::get_voting).delete(api::delete_voting),
        )
        .route(
            "/meetings/{id}/votings/{voting_id}/votes",
            post(api::cast_vote),
        )
        .route(
            "/meetings/{id}/votings/{voting_id}/votes/me",
            get(api::my_vote),
        )
        .route(
            "/meetings/{id}/votings/{voting_id}/close",
            post(api::close_voting),
        )
        .route(
            "/meetings/{id}/votings/{voting_id}/result",
            get(api::voting_result),
        )
        .route(
            "/meetings/{id}/votings/{voting_id}/tie-break",
            post(api::tie_break),
        )
        // Apply PSK auth middleware
        .layer(middleware::from_fn(move |req, next| {
            auth::psk_auth_layer(psk.clone(), req, next)
        }));

    // Health check (no auth required)
    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
