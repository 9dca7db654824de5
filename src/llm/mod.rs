pub mod openai;
pub mod tokens;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{BudgetConfig, LlmConfig};
use crate::error::LlmError;
use crate::ratelimit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::usage::{TokenUsageRecord, UsageLedger};

pub use tokens::{Prompt, PromptSection, estimate_tokens, fit_to_budget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Token counters reported by the provider, when it reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ProviderUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<ProviderUsage>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// One attempt; retries and timeouts are the client's job.
    async fn chat(&self, request: &ChatRequest) -> Result<Completion, LlmError>;
}

/// Wraps a provider with prompt fitting, rate limiting, per-attempt timeouts,
/// retries, budget checks, and usage accounting.
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    ledger: Arc<dyn UsageLedger>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    call_timeout: Duration,
    temperature: f32,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(
        config: &LlmConfig,
        provider: Arc<dyn LlmProvider>,
        ledger: Arc<dyn UsageLedger>,
    ) -> Self {
        Self {
            provider,
            ledger,
            limiter: Arc::new(RateLimiter::per_minute(config.rate_limit_per_minute)),
            retry: config.retry.policy(),
            call_timeout: Duration::from_secs(config.timeout_secs.max(1)),
            temperature: config.temperature,
            config: config.clone(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn UsageLedger> {
        &self.ledger
    }

    pub fn default_model(&self) -> &str {
        &self.config.model
    }

    pub fn max_output_tokens(&self) -> u32 {
        self.config.max_output_tokens
    }

    pub async fn complete(
        &self,
        prompt: &Prompt,
        model: &str,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let limit = self.config.input_limit_for(model);
        let prompt = fit_to_budget(prompt, limit)?;
        let request = ChatRequest {
            model: model.to_owned(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: prompt.system.clone(),
                },
                ChatMessage {
                    role: Role::User,
                    content: prompt.user_text(),
                },
            ],
            max_tokens,
            temperature: self.temperature,
        };
        let prompt_estimate = prompt.estimated_tokens() as u64;

        self.retry
            .run("llm", LlmError::is_retryable, |attempt| {
                let request = &request;
                async move {
                    check_budget(&self.config.budget, self.ledger.as_ref())?;
                    self.limiter.acquire().await;
                    tracing::debug!(
                        provider = self.provider.name(),
                        model = %request.model,
                        attempt,
                        prompt_tokens = prompt_estimate,
                        "llm call"
                    );

                    let completion =
                        match tokio::time::timeout(self.call_timeout, self.provider.chat(request))
                            .await
                        {
                            Ok(result) => result?,
                            Err(_) => {
                                return Err(LlmError::Timeout {
                                    secs: self.call_timeout.as_secs().max(1),
                                });
                            }
                        };

                    self.record_usage(model, prompt_estimate, &completion).await;
                    if completion.text.trim().is_empty() {
                        return Err(LlmError::EmptyCompletion);
                    }
                    Ok(completion.text)
                }
            })
            .await
    }

    async fn record_usage(&self, model: &str, prompt_estimate: u64, completion: &Completion) {
        let (prompt_tokens, completion_tokens) = match completion.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (prompt_estimate, estimate_tokens(&completion.text) as u64),
        };
        let record = TokenUsageRecord {
            timestamp: Utc::now(),
            model: model.to_owned(),
            prompt_tokens,
            completion_tokens,
            cost: self.config.pricing.cost(prompt_tokens, completion_tokens),
        };
        if let Err(err) = self.ledger.record(record).await {
            tracing::warn!(error = %format!("{err:#}"), "failed to record token usage");
        }
    }
}

fn check_budget(budget: &BudgetConfig, ledger: &dyn UsageLedger) -> Result<(), LlmError> {
    let totals = ledger.totals();
    if let Some(max) = budget.max_total_tokens
        && totals.total_tokens >= max
    {
        return Err(LlmError::BudgetExceeded(format!(
            "token budget spent ({} of {max})",
            totals.total_tokens
        )));
    }
    if let Some(max) = budget.max_cost
        && totals.cost >= max
    {
        return Err(LlmError::BudgetExceeded(format!(
            "cost budget spent ({:.4} of {max:.4})",
            totals.cost
        )));
    }
    Ok(())
}
