mod http;

use std::sync::Arc;

use axum::routing::post;
use axum::Router;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use common::config::PipelineConfig;
use common::step::Registry;
use common::steps::register_builtin;

use crate::http::pipeline::{run_pipeline, AppState};

// admin/CLI surface is deliberately thin: broader deployment packaging and
// administration tooling is an external collaborator, so this binary only
// needs enough to point the process at a bind address and let the rest come
// from the environment
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long)]
    bind_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();
    if let Some(bind_addr) = cli.bind_addr {
        config.bind_addr = bind_addr;
    }
    let config = Arc::new(config);

    let registry = Registry::new();
    register_builtin(&registry, config.clone());

    let state = AppState {
        registry,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/pipeline", post(run_pipeline))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "pipeline server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
