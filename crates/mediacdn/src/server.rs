use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use mediacdn_service::config::Config;
use mediacdn_service::metric;
use mediacdn_service::orchestrator::CacheOrchestrator;

use crate::endpoints::{self, EdgeState, OriginState};

fn web_runtime() -> Result<tokio::runtime::Runtime> {
    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("mediacdn-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;
    Ok(runtime)
}

fn serve(runtime: &tokio::runtime::Runtime, bind: &str, app: Router) -> Result<()> {
    let socket = bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{bind}`"))?;
    tracing::info!("Starting HTTP server on {}", socket);

    runtime.block_on(axum_server::bind(socket).serve(app.into_make_service()))?;
    tracing::info!("System shutdown complete");
    Ok(())
}

/// Starts the caching edge node based on the loaded config.
pub fn run_edge(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1, "role" => "edge");

    let runtime = web_runtime()?;

    let orchestrator = CacheOrchestrator::from_config(&config.edge)
        .context("failed to create edge service state")?;
    orchestrator
        .store()
        .clear_tmp()
        .context("failed to clear staging directory")?;
    tracing::info!(
        cache_dir = %config.edge.cache_dir.display(),
        origin = %config.edge.origin_url,
        "Using object store"
    );

    let state = EdgeState {
        orchestrator,
        max_age: config.edge.max_age,
    };
    serve(&runtime, &config.edge.bind, endpoints::create_edge_app(state))
}

/// Starts the origin file server based on the loaded config.
pub fn run_origin(config: Config) -> Result<()> {
    metric!(counter("server.starting") += 1, "role" => "origin");

    let runtime = web_runtime()?;

    let content_dir = &config.origin.content_dir;
    if !content_dir.is_dir() {
        tracing::warn!(
            "Content directory {} does not exist, serving nothing",
            content_dir.display()
        );
    }

    let state = OriginState::new(content_dir.clone(), config.origin.max_age);
    serve(&runtime, &config.origin.bind, endpoints::create_origin_app(state))
}
