use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use webcontent_analyzer::analyze::Analyzer;
use webcontent_analyzer::config::AnalyzerConfig;
use webcontent_analyzer::server::{AppState, router};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// YAML config file. `WCA_*` environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    webcontent_analyzer::logging::init_server()?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting webcontent-analyzer-app");

    let config = AnalyzerConfig::load(args.config.as_deref()).context("load config")?;
    let analyzer = Analyzer::from_config(config)
        .await
        .context("build analyzer")?;
    let state = AppState::new(Arc::new(analyzer));
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(%err, "install ctrl-c handler");
            }
            tracing::info!("shutting down; cancelling in-flight analyses");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}
