use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::aggregate::{ChunkAnalysis, aggregate};
use crate::cache::{AnalysisCache, CacheKey, SingleFlight};
use crate::chunk::{Chunk, chunk};
use crate::config::{AnalyzerConfig, SafetyMode};
use crate::error::{AnalyzeError, LlmError};
use crate::extract::{ExtractedContent, extract};
use crate::fetch::{ContentFetcher, FetchOptions};
use crate::llm::openai::OpenAiProvider;
use crate::llm::{LlmClient, Prompt};
use crate::model::{
    AnalysisOptions, AnalysisRequest, AnalysisResult, AnalysisType, CacheStatus, DocumentAnalysis,
};
use crate::prompt::{DocumentContext, PromptTemplate, template_for};
use crate::response::{ExpectedSchema, ModelVerdict, classify};
use crate::robots;
use crate::usage::{UsageLedger, open_ledger};
use crate::validate::UrlValidator;

/// Lifecycle of one chunk inside an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    CacheCheck,
    CacheHit,
    Dispatched,
    AwaitingLlm,
    Validating,
    Done,
    Failed,
}

impl ChunkState {
    pub fn can_advance_to(self, next: ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (self, next),
            (Pending, CacheCheck)
                | (CacheCheck, CacheHit)
                | (CacheCheck, Dispatched)
                | (CacheHit, Done)
                | (Dispatched, AwaitingLlm)
                | (Dispatched, Failed)
                | (AwaitingLlm, Validating)
                | (AwaitingLlm, Failed)
                | (Validating, Done)
                | (Validating, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkState::Done | ChunkState::Failed)
    }
}

#[derive(Debug)]
struct ChunkTracker {
    index: usize,
    state: ChunkState,
}

impl ChunkTracker {
    fn new(index: usize) -> Self {
        Self {
            index,
            state: ChunkState::Pending,
        }
    }

    fn advance(&mut self, next: ChunkState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "chunk {} cannot go from {:?} to {:?}",
            self.index,
            self.state,
            next
        );
        tracing::trace!(chunk_index = self.index, from = ?self.state, to = ?next, "chunk state");
        self.state = next;
    }
}

enum ChunkOutcome {
    Fresh {
        key: CacheKey,
        result: AnalysisResult,
    },
    Failed(String),
    Budget(String),
}

struct ChunkReport {
    index: usize,
    chars: usize,
    outcome: ChunkOutcome,
}

/// Everything one chunk task needs; cloned into each spawned task.
#[derive(Clone)]
struct ChunkWorker {
    llm: Arc<LlmClient>,
    model: String,
    max_output_tokens: u32,
    schema: ExpectedSchema,
    safety_mode: SafetyMode,
}

impl ChunkWorker {
    /// Runs one dispatched chunk. `_permit` is an LLM slot held until the
    /// task ends or is aborted.
    async fn run(
        self,
        chunk: Chunk,
        key: CacheKey,
        prompt: Prompt,
        mut tracker: ChunkTracker,
        _permit: OwnedSemaphorePermit,
    ) -> ChunkReport {
        let report = |outcome| ChunkReport {
            index: chunk.index,
            chars: chunk.text.chars().count(),
            outcome,
        };

        tracker.advance(ChunkState::AwaitingLlm);
        let raw = match self
            .llm
            .complete(&prompt, &self.model, self.max_output_tokens)
            .await
        {
            Ok(raw) => raw,
            Err(LlmError::BudgetExceeded(msg)) => {
                tracker.advance(ChunkState::Failed);
                return report(ChunkOutcome::Budget(msg));
            }
            Err(err) => {
                tracker.advance(ChunkState::Failed);
                return report(ChunkOutcome::Failed(err.to_string()));
            }
        };

        tracker.advance(ChunkState::Validating);
        match classify(&raw, &self.schema, self.safety_mode) {
            ModelVerdict::Valid(result) => {
                tracker.advance(ChunkState::Done);
                report(ChunkOutcome::Fresh { key, result })
            }
            ModelVerdict::Flagged(result) => {
                tracing::warn!(
                    chunk_index = chunk.index,
                    reasons = ?result.flag_reasons,
                    "model output flagged by safety filter"
                );
                tracker.advance(ChunkState::Done);
                report(ChunkOutcome::Fresh { key, result })
            }
            ModelVerdict::Malformed(failure) => {
                tracker.advance(ChunkState::Failed);
                report(ChunkOutcome::Failed(failure.to_string()))
            }
        }
    }
}

/// Shared value of one document-level computation.
#[derive(Debug, Clone)]
struct DocumentOutcome {
    result: AnalysisResult,
    chunks_total: usize,
    chunks_failed: Vec<usize>,
    from_cache: bool,
}

/// The whole pipeline: validate, fetch, extract, chunk, analyze, cache,
/// aggregate. One instance serves every request in the process.
pub struct Analyzer {
    config: AnalyzerConfig,
    validator: UrlValidator,
    fetcher: ContentFetcher,
    cache: Arc<AnalysisCache>,
    llm: Arc<LlmClient>,
    permits: Arc<Semaphore>,
    flights: SingleFlight<DocumentOutcome>,
}

impl Analyzer {
    /// Builds the production stack: OpenAI-compatible provider, configured
    /// ledger and cache tiers, system DNS resolver.
    pub async fn from_config(config: AnalyzerConfig) -> anyhow::Result<Self> {
        let ledger = open_ledger(&config.usage).await?;
        let provider = Arc::new(OpenAiProvider::from_config(&config.llm)?);
        let llm = LlmClient::new(&config.llm, provider, ledger);
        let cache = AnalysisCache::open(&config.cache).await?;
        let validator = UrlValidator::new(&config.validator);
        Self::new(config, validator, cache, llm)
    }

    pub fn new(
        config: AnalyzerConfig,
        validator: UrlValidator,
        cache: AnalysisCache,
        llm: LlmClient,
    ) -> anyhow::Result<Self> {
        let fetcher = ContentFetcher::new(&config.fetch, validator.clone())?;
        let permits = Arc::new(Semaphore::new(config.llm.concurrency.max(1)));
        Ok(Self {
            config,
            validator,
            fetcher,
            cache: Arc::new(cache),
            llm: Arc::new(llm),
            permits,
            flights: SingleFlight::new(),
        })
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn UsageLedger> {
        self.llm.ledger()
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    pub fn validator(&self) -> &UrlValidator {
        &self.validator
    }

    /// LLM slots not held by any chunk task right now.
    pub fn idle_llm_slots(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn analyze_url(
        &self,
        request: &AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<DocumentAnalysis, AnalyzeError> {
        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let span = tracing::info_span!("analyze", request_id = %request_id, url = %request.url);
        let options =
            AnalysisOptions::from_map(&request.options).map_err(AnalyzeError::InvalidOption)?;
        let budget = options
            .timeout
            .unwrap_or(Duration::from_secs(self.config.analysis.request_timeout_secs.max(1)));

        async {
            let started = Instant::now();
            tracing::info!(analysis_type = request.analysis_type.as_str(), "analysis started");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AnalyzeError::Cancelled),
                res = tokio::time::timeout(
                    budget,
                    self.run_pipeline(request, &options, &request_id, started),
                ) => {
                    res.unwrap_or(Err(AnalyzeError::TimedOut { secs: budget.as_secs().max(1) }))
                }
            };

            match &outcome {
                Ok(doc) => tracing::info!(
                    chunks = doc.chunks_total,
                    failed = doc.chunks_failed.len(),
                    cache = ?doc.cache,
                    elapsed_ms = doc.elapsed_ms,
                    "analysis finished"
                ),
                Err(err) => tracing::warn!(kind = %err.kind(), error = %err, "analysis failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// Analyzes already-extracted content with default options.
    pub async fn analyze(
        &self,
        extracted: &ExtractedContent,
        analysis_type: AnalysisType,
    ) -> Result<AnalysisResult, AnalyzeError> {
        let (outcome, _) = self
            .analyze_document(extracted, analysis_type, &AnalysisOptions::default())
            .await?;
        Ok(outcome.result)
    }

    async fn run_pipeline(
        &self,
        request: &AnalysisRequest,
        options: &AnalysisOptions,
        request_id: &str,
        started: Instant,
    ) -> Result<DocumentAnalysis, AnalyzeError> {
        let validated = self.validator.validate(&request.url).await?;

        if self.config.fetch.check_robots {
            robots::log_policy(
                self.fetcher.client(),
                &validated.url,
                &self.config.fetch.user_agent,
            )
            .await;
        }

        let fetch_options = FetchOptions {
            timeout: Duration::from_secs(self.config.fetch.timeout_secs.max(1)),
            max_bytes: self.config.fetch.max_bytes,
        };
        let document = self.fetcher.fetch(&validated.url, &fetch_options).await?;
        tracing::debug!(
            status = document.status_code,
            bytes = document.content_length,
            final_url = %document.final_url,
            "fetched document"
        );

        let html = document.html_lossy();
        let extracted = tokio::task::spawn_blocking(move || extract(&html))
            .await
            .map_err(|err| AnalyzeError::Internal(format!("extract task: {err}")))?;
        if extracted.text.trim().is_empty() {
            return Err(AnalyzeError::NoContent);
        }

        let (outcome, cache) = self
            .analyze_document(&extracted, request.analysis_type, options)
            .await?;

        Ok(DocumentAnalysis {
            request_id: request_id.to_owned(),
            url: request.url.clone(),
            final_url: document.final_url.to_string(),
            title: extracted.title.clone(),
            language: extracted.language.clone(),
            analysis_type: request.analysis_type,
            result: outcome.result,
            chunks_total: outcome.chunks_total,
            chunks_failed: outcome.chunks_failed,
            cache,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn analyze_document(
        &self,
        extracted: &ExtractedContent,
        analysis_type: AnalysisType,
        options: &AnalysisOptions,
    ) -> Result<(DocumentOutcome, CacheStatus), AnalyzeError> {
        if extracted.text.trim().is_empty() {
            return Err(AnalyzeError::NoContent);
        }
        let template = template_for(analysis_type);
        let model = self.llm.default_model().to_owned();
        let max_chunk_chars = options
            .max_chunk_chars
            .unwrap_or(self.config.chunk.max_chunk_chars);
        let chunks = chunk(extracted, max_chunk_chars);
        let doc_key = self.cache.key_for(&extracted.text, template.id, &model);
        let read_cache = !options.bypass_cache;

        if read_cache && let Some(hit) = self.cache.get(&doc_key).await {
            tracing::info!(key = %doc_key, "document cache hit");
            let outcome = DocumentOutcome {
                result: hit,
                chunks_total: chunks.len(),
                chunks_failed: Vec::new(),
                from_cache: true,
            };
            return Ok((outcome, CacheStatus::Hit));
        }

        let (chunks, doc_key_ref, model) = (&chunks, &doc_key, model.as_str());
        let flight = self
            .flights
            .run(&doc_key, move || async move {
                if read_cache && let Some(hit) = self.cache.get(doc_key_ref).await {
                    return Ok(DocumentOutcome {
                        result: hit,
                        chunks_total: chunks.len(),
                        chunks_failed: Vec::new(),
                        from_cache: true,
                    });
                }
                let outcome = self
                    .analyze_chunks(extracted, chunks, template, model, read_cache)
                    .await?;
                if outcome.chunks_failed.is_empty() {
                    self.cache
                        .set(doc_key_ref, &outcome.result, self.cache.default_ttl())
                        .await;
                }
                Ok::<_, AnalyzeError>(outcome)
            })
            .await?;

        let status = match (flight.computed, flight.value.from_cache) {
            (false, _) => CacheStatus::Coalesced,
            (true, true) => CacheStatus::Hit,
            (true, false) => CacheStatus::Miss,
        };
        Ok((flight.value, status))
    }

    async fn analyze_chunks(
        &self,
        extracted: &ExtractedContent,
        chunks: &[Chunk],
        template: &PromptTemplate,
        model: &str,
        read_cache: bool,
    ) -> Result<DocumentOutcome, AnalyzeError> {
        let worker = ChunkWorker {
            llm: Arc::clone(&self.llm),
            model: model.to_owned(),
            max_output_tokens: self.llm.max_output_tokens(),
            schema: ExpectedSchema::for_type(template.analysis_type),
            safety_mode: self.config.analysis.safety_mode,
        };
        let doc = DocumentContext {
            title: extracted.title.as_deref(),
            language: extracted.language.as_deref(),
            chunks_total: chunks.len(),
        };

        // Slots are taken here, one chunk at a time, so the LLM sees chunks
        // in document order.
        let started_at = Instant::now();
        let mut succeeded = Vec::new();
        let mut fresh = Vec::new();
        let mut failed = Vec::new();
        let mut join_set = tokio::task::JoinSet::new();
        for c in chunks {
            let key = self.cache.key_for(&c.text, template.id, model);
            let mut tracker = ChunkTracker::new(c.index);
            tracker.advance(ChunkState::CacheCheck);
            if read_cache && let Some(result) = self.cache.get(&key).await {
                tracker.advance(ChunkState::CacheHit);
                tracker.advance(ChunkState::Done);
                tracing::debug!(chunk_index = c.index, "chunk cache hit");
                succeeded.push(ChunkAnalysis {
                    index: c.index,
                    chars: c.text.chars().count(),
                    result,
                });
                continue;
            }

            tracker.advance(ChunkState::Dispatched);
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| AnalyzeError::Internal("llm permits closed".to_owned()))?;
            let prompt = template.render(c, doc);
            join_set.spawn(worker.clone().run(c.clone(), key, prompt, tracker, permit));
        }

        while let Some(joined) = join_set.join_next().await {
            let report =
                joined.map_err(|err| AnalyzeError::Internal(format!("chunk task: {err}")))?;
            let result = match report.outcome {
                ChunkOutcome::Fresh { key, result } => {
                    fresh.push((key, result.clone()));
                    result
                }
                ChunkOutcome::Failed(error) => {
                    tracing::warn!(chunk_index = report.index, %error, "chunk analysis failed");
                    failed.push(report.index);
                    continue;
                }
                ChunkOutcome::Budget(message) => {
                    tracing::warn!(
                        chunk_index = report.index,
                        %message,
                        "budget exceeded; aborting"
                    );
                    return Err(AnalyzeError::BudgetExceeded(message));
                }
            };
            succeeded.push(ChunkAnalysis {
                index: report.index,
                chars: report.chars,
                result,
            });

            let done = succeeded.len() + failed.len();
            if done % 10 == 0 || done == chunks.len() {
                tracing::info!(
                    done,
                    total = chunks.len(),
                    failed = failed.len(),
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "chunk progress"
                );
            }
        }

        failed.sort_unstable();
        let Some(result) = aggregate(&succeeded) else {
            return Err(AnalyzeError::AllChunksFailed {
                chunks: chunks.len(),
            });
        };

        for (key, chunk_result) in &fresh {
            self.cache
                .set(key, chunk_result, self.cache.default_ttl())
                .await;
        }

        Ok(DocumentOutcome {
            result,
            chunks_total: chunks.len(),
            chunks_failed: failed,
            from_cache: false,
        })
    }
}
