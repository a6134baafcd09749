use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shopfront_api::{build_gateway_registry, config, create_router, db, events, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load_config().context("failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));
    if cfg.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(environment = %cfg.environment, "Starting shopfront-api");

    let pool = db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;
    if cfg.auto_migrate {
        db::run_migrations(&pool)
            .await
            .context("failed to run migrations")?;
    }

    let (event_sender, event_rx) = events::channel();
    tokio::spawn(events::process_events(event_rx));

    let gateways = build_gateway_registry(&cfg.payments);
    info!(gateways = ?gateways.names(), "Payment gateways registered");

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let state = AppState::build(Arc::new(pool), cfg, gateways, event_sender);
    let app = create_router(state);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
