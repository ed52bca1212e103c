use std::future::ready;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use factory_common::metrics::setup_metrics_recorder;
use factory_common::service::EventService;
use factory_common::store::PgEventStore;
use factory_common::time::SystemTime;

use config::Config;

mod config;
mod error;
mod handlers;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::init_from_env()?;

    let store = PgEventStore::new(&config.database_url, config.max_pg_connections).await?;
    let service = EventService::new(store, SystemTime {});

    let mut app = handlers::add_routes(
        Router::new(),
        service,
        config.max_body_size,
        config.concurrency_limit,
    );

    if config.export_prometheus {
        let recorder_handle = setup_metrics_recorder()?;
        app = app.route("/metrics", get(move || ready(recorder_handle.render())));
    }

    tracing::info!("listening on {}", config.bind());

    listen(app, config.bind()).await
}
