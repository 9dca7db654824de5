use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use webcontent_analyzer::cli::{CacheCommand, Cli, Command, UsageCommand};
use webcontent_analyzer::commands;
use webcontent_analyzer::config::AnalyzerConfig;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    webcontent_analyzer::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let config = AnalyzerConfig::load(cli.config.as_deref()).context("load config")?;

    match cli.command {
        Command::Analyze(args) => {
            commands::analyze(config, args).await.context("analyze")?;
        }
        Command::Validate(args) => {
            commands::validate(config, args).await.context("validate")?;
        }
        Command::Usage {
            command: UsageCommand::Show,
        } => {
            commands::usage_show(config).await.context("usage show")?;
        }
        Command::Usage {
            command: UsageCommand::Reset,
        } => {
            commands::usage_reset(config).await.context("usage reset")?;
        }
        Command::Cache {
            command: CacheCommand::Purge,
        } => {
            commands::cache_purge(config).await.context("cache purge")?;
        }
    }

    Ok(())
}
