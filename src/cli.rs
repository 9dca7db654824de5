use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::model::AnalysisType;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// YAML config file. `WCA_*` environment variables override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch a page and print its analysis as JSON.
    Analyze(AnalyzeArgs),
    /// Run only the URL safety checks.
    Validate(ValidateArgs),
    Usage {
        #[command(subcommand)]
        command: UsageCommand,
    },
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    /// Page URL (must be http/https).
    #[arg(long)]
    pub url: String,

    #[arg(long, value_enum, default_value_t = AnalysisType::Default)]
    pub analysis_type: AnalysisType,

    /// Overall deadline for this request.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Upper bound on chunk size (chars).
    #[arg(long)]
    pub max_chunk_chars: Option<usize>,

    /// Skip cache reads; fresh results are still written.
    #[arg(long)]
    pub no_cache: bool,

    /// Extra request option as `key=value`. Values are parsed as JSON when
    /// possible, otherwise kept as strings. Repeatable.
    #[arg(long = "option", value_name = "KEY=VALUE")]
    pub options: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    #[arg(long)]
    pub url: String,
}

#[derive(Debug, Subcommand)]
pub enum UsageCommand {
    /// Print token and cost totals from the configured ledger.
    Show,
    /// Clear the configured ledger.
    Reset,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Remove every cached analysis.
    Purge,
}
