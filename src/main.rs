use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{AppState, router};
use encounters_core::{CoreConfig, Db, EncounterService, LoggingPublisher};

/// Main entry point for the encounters service
///
/// Resolves configuration, opens the encounter store and serves the REST API
/// (with OpenAPI/Swagger documentation) until the process is stopped.
///
/// # Environment Variables
/// - `DATABASE_PATH`: SQLite database file (default: "encounter_data/encounters.db")
/// - `ALLOW_DROP_DATA`: Enables the destructive `/drop_data` route when "true"
/// - `REST_ADDR`: REST server address (default: "0.0.0.0:3000")
///
/// # Returns
/// * `Ok(())` - If the server starts and runs successfully
/// * `Err(anyhow::Error)` - If startup or the running server fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("encounters_run=info".parse()?)
                .add_directive("api_rest=info".parse()?)
                .add_directive("encounters_core=info".parse()?),
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

    tracing::info!("++ Starting encounters REST on {}", config.rest_addr());
    tracing::info!("++ Encounter store at {}", config.database_path().display());
    if config.allow_drop_data() {
        tracing::info!("++ Destructive /drop_data route is enabled");
    }

    let db = Db::open(config.database_path())?;
    let state = AppState {
        service: EncounterService::new(db, Arc::new(LoggingPublisher)),
        config: config.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.rest_addr()).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}
