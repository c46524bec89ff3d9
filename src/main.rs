use std::sync::Arc;

use anyhow::Context;
use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use dotenv::dotenv;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use homehire::{
    config::Config,
    db::{DBClient, MemoryDb, Store},
    routes::create_router,
    service::{background_jobs::start_settlement_job, payment_gateway::gateway_from_config},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init();

    let db_client: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let client = DBClient::connect(url, config.max_db_connections)
                .await
                .context("Failed to connect to the database")?;
            tracing::info!("✅ Connection to the database is successful");
            Arc::new(client)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, running on the in-memory store");
            Arc::new(MemoryDb::new())
        }
    };

    let gateway = gateway_from_config(&config).context("Failed to build the payment gateway client")?;
    let app_state = Arc::new(
        AppState::new(config.clone(), db_client, gateway).context("Invalid escrow configuration")?,
    );

    tokio::spawn(start_settlement_job(app_state.clone()));

    let allowed_origins = ["http://localhost:5173", "http://localhost:8000"]
        .into_iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_headers([AUTHORIZATION, ACCEPT, CONTENT_TYPE])
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT]);

    let app = create_router(app_state).layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;

    tracing::info!("🚀 Server is running on http://localhost:{}", config.port);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
