use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;

use crate::config::UsageConfig;

/// One completion's token accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

impl TokenUsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

/// Append-only token ledger shared by every analysis in the process.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn record(&self, record: TokenUsageRecord) -> anyhow::Result<()>;
    fn totals(&self) -> UsageTotals;
    async fn records(&self) -> anyhow::Result<Vec<TokenUsageRecord>>;
    /// Operator action; clears records and totals.
    async fn reset(&self) -> anyhow::Result<()>;
}

/// Lock-free running totals. Cost is kept in micro-dollars so it can live in
/// an atomic.
#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    cost_micros: AtomicU64,
}

impl Counters {
    fn add(&self, record: &TokenUsageRecord) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.prompt_tokens
            .fetch_add(record.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(record.completion_tokens, Ordering::Relaxed);
        self.cost_micros
            .fetch_add(to_micros(record.cost), Ordering::Relaxed);
    }

    fn clear(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.prompt_tokens.store(0, Ordering::Relaxed);
        self.completion_tokens.store(0, Ordering::Relaxed);
        self.cost_micros.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> UsageTotals {
        let prompt_tokens = self.prompt_tokens.load(Ordering::Relaxed);
        let completion_tokens = self.completion_tokens.load(Ordering::Relaxed);
        UsageTotals {
            calls: self.calls.load(Ordering::Relaxed),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost: self.cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

fn to_micros(cost: f64) -> u64 {
    if cost.is_finite() && cost > 0.0 {
        (cost * 1_000_000.0).round() as u64
    } else {
        0
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    counters: Counters,
    records: Mutex<Vec<TokenUsageRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLedger for InMemoryLedger {
    async fn record(&self, record: TokenUsageRecord) -> anyhow::Result<()> {
        let mut records = self.records.lock().await;
        self.counters.add(&record);
        records.push(record);
        Ok(())
    }

    fn totals(&self) -> UsageTotals {
        self.counters.snapshot()
    }

    async fn records(&self) -> anyhow::Result<Vec<TokenUsageRecord>> {
        Ok(self.records.lock().await.clone())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        let mut records = self.records.lock().await;
        records.clear();
        self.counters.clear();
        Ok(())
    }
}

/// JSON-lines ledger; one record per line, totals rebuilt on open.
#[derive(Debug)]
pub struct JsonlLedger {
    path: PathBuf,
    counters: Counters,
    write_lock: Mutex<()>,
}

impl JsonlLedger {
    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create ledger dir: {}", parent.display()))?;
        }
        let ledger = Self {
            path,
            counters: Counters::default(),
            write_lock: Mutex::new(()),
        };
        for record in ledger.read_all().await? {
            ledger.counters.add(&record);
        }
        tracing::debug!(
            path = %ledger.path.display(),
            calls = ledger.counters.snapshot().calls,
            "opened usage ledger"
        );
        Ok(ledger)
    }

    async fn read_all(&self) -> anyhow::Result<Vec<TokenUsageRecord>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read ledger: {}", self.path.display()));
            }
        };
        let mut out = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TokenUsageRecord>(line) {
                Ok(record) => out.push(record),
                Err(err) => tracing::warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    %err,
                    "skipping malformed ledger line"
                ),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl UsageLedger for JsonlLedger {
    async fn record(&self, record: TokenUsageRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&record).context("serialize usage record")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open ledger: {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("append ledger: {}", self.path.display()))?;
        file.flush().await?;
        self.counters.add(&record);
        Ok(())
    }

    fn totals(&self) -> UsageTotals {
        self.counters.snapshot()
    }

    async fn records(&self) -> anyhow::Result<Vec<TokenUsageRecord>> {
        let _guard = self.write_lock.lock().await;
        self.read_all().await
    }

    async fn reset(&self) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("remove ledger: {}", self.path.display()));
            }
        }
        self.counters.clear();
        tracing::info!(path = %self.path.display(), "usage ledger reset");
        Ok(())
    }
}

/// JSONL ledger when a path is configured, in-memory otherwise.
pub async fn open_ledger(config: &UsageConfig) -> anyhow::Result<Arc<dyn UsageLedger>> {
    Ok(match &config.ledger_path {
        Some(path) => Arc::new(JsonlLedger::open(path.clone()).await?),
        None => Arc::new(InMemoryLedger::new()),
    })
}
