use std::io::IsTerminal as _;

use anyhow::Context as _;

/// Directives applied when `RUST_LOG` is unset. The HTML parser is chatty at
/// debug, so it stays at warn unless asked for explicitly.
const CLI_DEFAULT: &str = "info,html5ever=warn,selectors=warn";
const SERVER_DEFAULT: &str = "info,html5ever=warn,selectors=warn,tower_http=debug";

/// Logging for the command-line tool. Stdout carries results, so logs go to
/// stderr.
pub fn init() -> anyhow::Result<()> {
    init_with(CLI_DEFAULT)
}

/// Logging for the HTTP app; also shows per-request spans from `TraceLayer`.
pub fn init_server() -> anyhow::Result<()> {
    init_with(SERVER_DEFAULT)
}

fn init_with(default_directives: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_directives))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
