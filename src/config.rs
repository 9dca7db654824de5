use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub validator: ValidatorConfig,
    pub fetch: FetchConfig,
    pub chunk: ChunkConfig,
    pub cache: CacheConfig,
    pub llm: LlmConfig,
    pub analysis: AnalysisConfig,
    pub usage: UsageConfig,
}

impl AnalyzerConfig {
    /// Reads an optional YAML file, then applies `WCA_*` environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read config: {}", path.display()))?;
                serde_yaml::from_str::<Self>(&raw)
                    .with_context(|| format!("parse config: {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env().context("apply environment overrides")?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Some(v) = env("WCA_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = env("WCA_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = env("WCA_CACHE_DIR") {
            self.cache.persistent_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("WCA_USAGE_LEDGER") {
            self.usage.ledger_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("WCA_LLM_CONCURRENCY") {
            self.llm.concurrency = v
                .parse()
                .with_context(|| format!("invalid WCA_LLM_CONCURRENCY={v:?}"))?;
        }
        if let Some(v) = env("WCA_RATE_LIMIT_PER_MINUTE") {
            self.llm.rate_limit_per_minute = v
                .parse()
                .with_context(|| format!("invalid WCA_RATE_LIMIT_PER_MINUTE={v:?}"))?;
        }
        if let Some(v) = env("WCA_ALLOW_PRIVATE_NETWORKS") {
            self.validator.allow_private_networks = parse_bool(&v)
                .with_context(|| format!("invalid WCA_ALLOW_PRIVATE_NETWORKS={v:?}"))?;
        }
        Ok(())
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

fn parse_bool(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Hosts (and their subdomains) that are never fetched.
    pub blocklist: Vec<String>,
    pub resolve_dns: bool,
    /// Development escape hatch; never enable for untrusted input.
    pub allow_private_networks: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            blocklist: vec!["metadata.google.internal".to_owned()],
            resolve_dns: true,
            allow_private_networks: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_bytes: u64,
    pub max_redirects: usize,
    pub user_agent: String,
    pub check_robots: bool,
    pub retry: RetryConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_bytes: 5_000_000,
            max_redirects: 5,
            user_agent: concat!("webcontent-analyzer/", env!("CARGO_PKG_VERSION")).to_owned(),
            check_robots: true,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub max_chunk_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 6_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory_ttl_secs: u64,
    pub memory_max_entries: usize,
    /// Persistent tier root; `None` disables the tier.
    pub persistent_dir: Option<PathBuf>,
    pub persistent_ttl_secs: u64,
    pub persistent_max_entries: usize,
    pub sample_threshold_chars: usize,
    pub sample_chars: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ttl_secs: 15 * 60,
            memory_max_entries: 1_000,
            persistent_dir: None,
            persistent_ttl_secs: 7 * 24 * 60 * 60,
            persistent_max_entries: 10_000,
            sample_threshold_chars: 50_000,
            sample_chars: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub model: String,
    pub max_input_tokens: usize,
    /// Per-model input limits; falls back to `max_input_tokens`.
    pub model_input_tokens: BTreeMap<String, usize>,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub concurrency: usize,
    pub rate_limit_per_minute: usize,
    pub retry: RetryConfig,
    pub pricing: Pricing,
    pub budget: BudgetConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_owned(),
            api_key_env: "OPENAI_API_KEY".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            max_input_tokens: 4_096,
            model_input_tokens: BTreeMap::new(),
            max_output_tokens: 1_024,
            temperature: 0.2,
            timeout_secs: 60,
            concurrency: 5,
            rate_limit_per_minute: 60,
            retry: RetryConfig::default(),
            pricing: Pricing::default(),
            budget: BudgetConfig::default(),
        }
    }
}

impl LlmConfig {
    pub fn input_limit_for(&self, model: &str) -> usize {
        self.model_input_tokens
            .get(model)
            .copied()
            .unwrap_or(self.max_input_tokens)
    }
}

/// USD per 1k tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            prompt_per_1k: 0.000_15,
            completion_per_1k: 0.000_6,
        }
    }
}

impl Pricing {
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.prompt_per_1k
            + (completion_tokens as f64 / 1000.0) * self.completion_per_1k
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_total_tokens: Option<u64>,
    pub max_cost: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyMode {
    /// Unsafe output marks the chunk failed.
    Discard,
    /// Unsafe output is kept with `flagged: true`.
    Flag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub request_timeout_secs: u64,
    pub safety_mode: SafetyMode,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            safety_mode: SafetyMode::Discard,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// JSONL ledger file; `None` keeps usage in memory only.
    pub ledger_path: Option<PathBuf>,
}
