//! Standalone REST API server binary.
//!
//! ## Purpose
//! Runs the REST API server on its own.
//!
//! ## Intended use
//! This binary is useful for development and debugging when you only want the REST server (with
//! OpenAPI/Swagger UI). The workspace's main `encounters-run` binary serves the same router.

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{router, AppState};
use encounters_core::{CoreConfig, Db, EncounterService, LoggingPublisher};

/// Main entry point for the encounters REST API server
///
/// Starts the REST API server on the configured address (default: 0.0.0.0:3000).
/// Provides HTTP endpoints for encounter operations with OpenAPI/Swagger documentation.
///
/// # Environment Variables
/// - `DATABASE_PATH`: SQLite database file (default: "encounter_data/encounters.db")
/// - `ALLOW_DROP_DATA`: Enables the destructive `/drop_data` route when "true"
/// - `REST_ADDR`: Server address (default: "0.0.0.0:3000")
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - the database cannot be opened,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_path =
        std::env::var("DATABASE_PATH").unwrap_or_else(|_| "encounter_data/encounters.db".into());
    let allow_drop_data =
        std::env::var("ALLOW_DROP_DATA").is_ok_and(|value| value.eq_ignore_ascii_case("true"));
    let rest_addr = std::env::var("REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let config = Arc::new(CoreConfig::new(
        PathBuf::from(database_path),
        allow_drop_data,
        rest_addr,
    )?);

    tracing::info!("-- Starting encounters REST API on {}", config.rest_addr());

    let db = Db::open(config.database_path())?;
    let state = AppState {
        service: EncounterService::new(db, Arc::new(LoggingPublisher)),
        config: config.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.rest_addr()).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}
