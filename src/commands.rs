use std::collections::BTreeMap;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use crate::analyze::Analyzer;
use crate::cache::AnalysisCache;
use crate::cli::{AnalyzeArgs, ValidateArgs};
use crate::config::AnalyzerConfig;
use crate::model::AnalysisRequest;
use crate::usage::open_ledger;
use crate::validate::UrlValidator;

pub async fn analyze(config: AnalyzerConfig, args: AnalyzeArgs) -> anyhow::Result<()> {
    let mut request = AnalysisRequest::new(&args.url, args.analysis_type);
    request.options = parse_options(&args.options)?;
    if let Some(secs) = args.timeout_secs {
        request = request.with_option("timeout_secs", secs.into());
    }
    if let Some(chars) = args.max_chunk_chars {
        request = request.with_option("max_chunk_chars", chars.into());
    }
    if args.no_cache {
        request = request.with_option("bypass_cache", true.into());
    }

    let analyzer = Analyzer::from_config(config).await.context("build analyzer")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let analysis = analyzer.analyze_url(&request, cancel).await?;
    let json = serde_json::to_string_pretty(&analysis).context("serialize analysis")?;
    println!("{json}");
    Ok(())
}

pub async fn validate(config: AnalyzerConfig, args: ValidateArgs) -> anyhow::Result<()> {
    let validator = UrlValidator::new(&config.validator);
    let validated = validator.validate(&args.url).await.map_err(|reason| {
        tracing::info!(url = %args.url, %reason, "url rejected");
        anyhow::anyhow!("url rejected: {reason}")
    })?;

    println!("ok {}", validated.url);
    for ip in &validated.resolved {
        println!("  resolved {ip}");
    }
    Ok(())
}

pub async fn usage_show(config: AnalyzerConfig) -> anyhow::Result<()> {
    if config.usage.ledger_path.is_none() {
        tracing::warn!("no usage.ledger_path configured; totals cover this process only");
    }
    let ledger = open_ledger(&config.usage).await.context("open usage ledger")?;
    let json = serde_json::to_string_pretty(&ledger.totals()).context("serialize totals")?;
    println!("{json}");
    Ok(())
}

pub async fn usage_reset(config: AnalyzerConfig) -> anyhow::Result<()> {
    let ledger = open_ledger(&config.usage).await.context("open usage ledger")?;
    ledger.reset().await.context("reset usage ledger")?;
    tracing::info!("usage ledger reset");
    Ok(())
}

pub async fn cache_purge(config: AnalyzerConfig) -> anyhow::Result<()> {
    let cache = AnalysisCache::open(&config.cache).await.context("open cache")?;
    let removed = cache.purge().await.context("purge cache")?;
    println!("removed {removed} cached analyses");
    Ok(())
}

/// `key=value` pairs; values that parse as JSON keep their type.
fn parse_options(raw: &[String]) -> anyhow::Result<BTreeMap<String, serde_json::Value>> {
    let mut options = BTreeMap::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            anyhow::bail!("invalid --option {pair:?}: expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("invalid --option {pair:?}: empty key");
        }
        let value = serde_json::from_str(value.trim())
            .unwrap_or_else(|_| serde_json::Value::String(value.to_owned()));
        options.insert(key.to_owned(), value);
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_keep_json_types() {
        let parsed = parse_options(&[
            "timeout_secs=5".to_owned(),
            "bypass_cache=true".to_owned(),
            "note=hello world".to_owned(),
        ])
        .unwrap();
        assert_eq!(parsed["timeout_secs"], serde_json::json!(5));
        assert_eq!(parsed["bypass_cache"], serde_json::json!(true));
        assert_eq!(parsed["note"], serde_json::json!("hello world"));
    }

    #[test]
    fn options_without_equals_are_rejected() {
        assert!(parse_options(&["timeout_secs".to_owned()]).is_err());
        assert!(parse_options(&["=5".to_owned()]).is_err());
    }
}
