//! Quartermaster - receiving document pipeline for fleet operations.
//!
//! Intake → OCR → Extraction → Reconciliation → Commit, behind a small
//! authenticated HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware as axum_mw,
    routing::{get, patch, post},
    Router,
};
use clap::Parser;
use dotenv::dotenv;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quartermaster_backend::api::{routes, AppState};
use quartermaster_backend::auth::{auth_middleware, JwtHandler};
use quartermaster_backend::config::Config;
use quartermaster_backend::db::Database;
use quartermaster_backend::extraction::llm::OpenAiClient;
use quartermaster_backend::intake::storage::LocalBlobStore;
use quartermaster_backend::middleware::{
    ip_rate_limit_middleware, request_logging_middleware, IpRateLimiter,
};
use quartermaster_backend::pipeline::ReceivingPipeline;

#[derive(Parser, Debug)]
#[command(name = "quartermaster", about = "Receiving document pipeline")]
struct Args {
    /// Listen port; overrides the PORT environment variable.
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database path; overrides DATABASE_PATH.
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "quartermaster_backend=info,quartermaster=info,tower_http=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }
    let config = Arc::new(config);

    info!(
        db = %config.database_path,
        blob_root = %config.blob_root,
        environment = %config.environment,
        "⚓ Quartermaster starting"
    );

    let db = Arc::new(Database::new(&config.database_path).context("database init failed")?);
    let blobs = Arc::new(LocalBlobStore::new(&config.blob_root));
    let llm = OpenAiClient::new(&config).map(|c| Arc::new(c) as _);
    if llm.is_none() {
        info!("No LLM credentials configured; extraction runs deterministic-only");
    }

    let pipeline = Arc::new(ReceivingPipeline::new(config.clone(), db.clone(), blobs, llm));
    let jwt = Arc::new(JwtHandler::new(&config.jwt_secret));

    let state = AppState {
        config: config.clone(),
        db,
        pipeline,
        jwt: jwt.clone(),
    };

    // Background housekeeping: temp sweeper and IP-window cleanup.
    tokio::spawn(ReceivingPipeline::run_temp_sweeper(config.clone()));
    let ip_limiter = IpRateLimiter::new(300, Duration::from_secs(60));
    {
        let limiter = ip_limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                limiter.cleanup();
            }
        });
    }

    let api = Router::new()
        .route("/images/upload", post(routes::upload_images))
        .route("/images/:image_id/status", get(routes::image_status))
        .route("/receiving/sessions/:session_id", get(routes::get_session))
        .route(
            "/receiving/sessions/:session_id/lines/:line_id/verify",
            patch(routes::verify_line),
        )
        .route("/receiving/sessions/:session_id/commit", post(routes::commit_session))
        .layer(axum_mw::from_fn_with_state(jwt, auth_middleware));

    let app = Router::new()
        .nest("/api/v1", api)
        .route("/health", get(routes::health))
        .layer(axum_mw::from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        .layer(axum_mw::from_fn(request_logging_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "🌐 Listening");
    let listener = tokio::net::TcpListener::bind(addr).await.context("bind failed")?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server error")?;

    Ok(())
}
