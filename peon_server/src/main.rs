//! Peon — continuous build and deploy orchestrator.
//!
//! Watches repositories (polling or GitHub webhooks), builds each pushed
//! commit in an isolated workspace following the repository's `.peon.yml`,
//! deploys the output, and publishes build status as static HTML pages and
//! GitHub commit statuses.

mod config;
mod metrics;
mod migration;
mod models;
mod routes;
mod schema;
mod services;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use crate::config::PeonConfig;
use crate::services::cache_service::CacheService;
use crate::services::dispatcher::Dispatcher;
use crate::services::github_service::GithubStatus;
use crate::services::legacy_import::import_legacy_status;
use crate::services::pipeline::{Pipeline, PipelineSettings};
use crate::services::render_service::RenderCoordinator;
use crate::services::status_pages::{Retrigger, StatusPages};
use crate::services::status_service::StatusService;
use crate::services::watcher::Watcher;
use crate::store::postgres::PgDatastore;
use crate::store::Datastore;

const DATABASE_POOL_SIZE: usize = 8;

#[derive(Parser)]
#[command(name = "peon", about = "Continuous build and deploy orchestrator")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "PEON_CONFIG", default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    let config = PeonConfig::load(&cli.config)?;

    tracing::info!("Starting peon...");

    metrics::init_metrics(config.metrics_listen);

    let store: Arc<dyn Datastore> = Arc::new(
        PgDatastore::connect(&config.database_url, DATABASE_POOL_SIZE)
            .await
            .context("connecting to the status database")?,
    );

    let imported = import_legacy_status(store.as_ref(), &config.legacy_status_directory())
        .await
        .context("importing legacy build status")?;
    if imported > 0 {
        tracing::info!("Imported {} legacy builds", imported);
    }

    // Status reporting
    let retrigger = config.webhooks.url.clone().map(|url| Retrigger {
        url,
        secret: config.webhooks.secret.clone(),
    });
    let pages = StatusPages::new(
        store.clone(),
        config.status_directory.clone(),
        config.index_build_count,
        retrigger,
    )?;
    let renderer = RenderCoordinator::open(
        Arc::new(pages),
        config.status_directory.join("render-state.json"),
    )
    .await;
    let github = GithubStatus::spawn(
        config.github_token.clone(),
        config.status_url.clone(),
        store.clone(),
    );
    let status = Arc::new(StatusService::new(
        store.clone(),
        Arc::new(github),
        renderer.clone(),
    ));

    // Build orchestration
    let cache = Arc::new(CacheService::new(
        config.cache_directory(),
        config.cache_validity(),
        config.cache_max_size,
    ));
    let pipeline = Pipeline::new(
        PipelineSettings {
            repos_directory: config.repos_directory(),
            workspace_root: std::env::temp_dir(),
            destinations: config.destinations.clone(),
        },
        status.clone(),
        cache,
    );
    let dispatcher = Arc::new(Dispatcher::new(
        &config.watcher,
        config.webhooks.enabled,
        status.clone(),
        Arc::new(pipeline),
    ));

    let aborted = status.abort_stale_builds().await?;
    if aborted > 0 {
        tracing::warn!("Aborted {} stale builds", aborted);
    }
    renderer.render();

    // Change sources
    let mut watchers = Vec::new();
    if config.watcher.enabled {
        let watcher = Arc::new(Watcher::new(
            config.watch_directory(),
            config.watcher.interval(),
        ));
        watchers = watcher.spawn(&config.watcher.repositories, dispatcher.clone());
        tracing::info!("Watching {} repositories", watchers.len());
    }

    if config.webhooks.enabled {
        let app = routes::webhook_router(routes::WebhookState {
            dispatcher: dispatcher.clone(),
            secret: config.webhooks.secret.clone(),
        });

        let addr = config.webhooks.listen;
        tracing::info!("Webhook server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding webhook listener on {addr}"))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    for watcher in watchers {
        watcher.abort();
    }
    tracing::info!("Waiting for status pages...");
    renderer.idle().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
