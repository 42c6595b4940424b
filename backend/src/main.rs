//! Wholesale Allocation Engine - Backend Server
//!
//! Hosts the stock ledger, allocator and reconciliation job behind a JSON API.

use std::{net::SocketAddr, sync::Arc};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wholesale_allocation_backend::{
    create_app,
    store::{postgres, PgAllocationStore},
    AllocationEngine, AppState, Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "alloc_server=debug,wholesale_allocation_backend=debug,tower_http=debug,sqlx=warn".into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Starting Wholesale Allocation Server");
    tracing::info!("Environment: {}", config.environment);
    tracing::info!(
        "Allocation: {} policy, {} retries, UTC{:+}",
        config.allocation.default_policy.as_str(),
        config.allocation.max_retries,
        config.allocation.utc_offset_hours
    );

    // Create database connection pool
    tracing::info!("Connecting to database...");
    let db_pool = postgres::connect(&config.database).await?;

    tracing::info!("Database connection established");

    // Run migrations in development
    if config.environment == "development" {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&db_pool).await?;
        tracing::info!("Migrations completed");
    }

    let store = Arc::new(PgAllocationStore::new(db_pool.clone()));
    let engine = AllocationEngine::new(store, config.allocation.clone());

    // Create application state
    let state = AppState {
        db: db_pool,
        config: Arc::new(config.clone()),
        engine,
    };

    // Build application
    let app = create_app(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
