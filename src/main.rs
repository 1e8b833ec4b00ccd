mod cli;
mod config;
mod handlers;
mod metrics;
mod pending;
mod reconciler;
mod store;
mod verifier;

use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    handlers::{build_router, AppState},
    pending::PendingRegistry,
    reconciler::Reconciler,
    store::LinkStore,
    verifier::{ChatVerifier, GameVerifier},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Some(Commands::Admin { url, command }) = cli.command {
        if let Err(err) = cli::run_admin_client(url, command).await {
            error!("admin client error: {}", err);
            std::process::exit(1);
        }
        return Ok(());
    }

    let config = Config::from_env();
    info!("starting tether link server on port {}", config.port);
    if config.uses_dev_secrets() {
        warn!(
            "CHAT_TOKEN_SECRET and/or GAME_TICKET_SECRET not set; \
             identity verification is running on dev placeholder secrets"
        );
    }

    let op_timeout = Duration::from_millis(config.store_timeout_ms);
    let store = match &config.database_url {
        Some(db_url) => match PgPoolOptions::new().max_connections(5).connect(db_url).await {
            Ok(pool) => {
                sqlx::migrate!("./migrations").run(&pool).await?;
                info!("connected to postgres; migrations applied");
                LinkStore::postgres(pool, op_timeout, config.store_retries)
            }
            Err(err) => {
                error!(error = %err, "failed to connect to postgres");
                std::process::exit(1);
            }
        },
        None => {
            warn!("DATABASE_URL not set; links are held in memory only");
            LinkStore::memory()
        }
    };

    let state = AppState {
        reconciler: Reconciler::new(store),
        pending: PendingRegistry::new(Duration::from_secs(config.pending_ttl_seconds)),
        chat_verifier: ChatVerifier::new(
            config.chat_token_secret.as_bytes(),
            config.chat_token_issuer.clone(),
            config.chat_token_audience.clone(),
        ),
        game_verifier: GameVerifier::new(config.game_ticket_secret.clone().into_bytes()),
    };

    let app = build_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("tether listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
