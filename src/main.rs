use library_catalog::{
    AppState,
    config::{AppConfig, Env},
    create_router,
    repository::PostgresRepository,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// main
///
/// Loads configuration, installs logging, connects to Postgres, builds the route
/// declaration table and serves the router.
#[tokio::main]
async fn main() {
    // 1. Configuration
    // `.env` is optional; AppConfig::load() panics if DATABASE_URL is absent.
    dotenv::dotenv().ok();
    let config = AppConfig::load();

    // 2. Log filter
    // RUST_LOG wins when set; otherwise debug for this crate and its HTTP stack.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "library_catalog=debug,tower_http=info,axum=trace".into());

    // 3. Subscriber per environment
    match config.env {
        Env::Local => {
            // LOCAL: multi-line pretty output for reading in a terminal.
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        Env::Production => {
            // PROD: one JSON object per line, carrying span fields such as
            // `correlation_id` and `handler` for the log pipeline.
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
    }

    tracing::info!("Application starting in {:?} mode", config.env);

    // 4. Database pool
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.db_url)
        .await
        .expect("FATAL: Failed to connect to Postgres. Check DATABASE_URL.");

    // 5. State assembly
    // One repository serves as catalog store, Caller Directory and permission store.
    let postgres = Arc::new(PostgresRepository::new(pool));
    let bind_addr = config.bind_addr.clone();

    // Also builds the route declaration table; a duplicate or empty declaration
    // stops startup here.
    let app_state = AppState::new(postgres.clone(), postgres.clone(), postgres, config)
        .expect("FATAL: invalid route policy declarations");

    tracing::info!(
        policies = app_state.policies.len(),
        permission_cache = app_state.config.permission_cache,
        "access pipeline configured"
    );
    for (key, policy) in app_state.policies.iter() {
        tracing::debug!(
            handler = %key,
            action = %policy.action,
            entity = %policy.entity,
            roles = ?policy.allowed_roles,
            "route policy registered"
        );
    }

    // 6. Router and server
    let app = create_router(app_state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .expect("FATAL: failed to bind listener");

    tracing::info!("Listening on {}", bind_addr);
    tracing::info!("API Documentation (Swagger UI) available at /library/api/v1/docs");

    axum::serve(listener, app)
        .await
        .expect("FATAL: server error");
}
