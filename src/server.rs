use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::analyze::Analyzer;
use crate::error::{AnalyzeError, ErrorKind};
use crate::model::{AnalysisRequest, DocumentAnalysis};
use crate::usage::UsageTotals;

#[derive(Clone)]
pub struct AppState {
    pub analyzer: Arc<Analyzer>,
    /// Cancelled on shutdown; every in-flight analysis holds a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(analyzer: Arc<Analyzer>) -> Self {
        Self {
            analyzer,
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/v1/analyze", post(analyze_handler))
        .route("/v1/usage", get(usage_handler))
        .route("/v1/usage/reset", post(usage_reset_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON error body: `{ "error": { "kind": ..., "message": ... } }`.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<AnalyzeError> for ApiError {
    fn from(err: AnalyzeError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Rejected | ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::FetchFailed | ErrorKind::NoContent => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::UpstreamUnavailable | ErrorKind::AllChunksFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::BudgetExceeded => StatusCode::TOO_MANY_REQUESTS,
        // nginx's "client closed request"
        ErrorKind::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "kind": self.kind, "message": self.message }
        });
        (status_for(self.kind), Json(body)).into_response()
    }
}

async fn analyze_handler(
    State(state): State<AppState>,
    payload: Result<Json<AnalysisRequest>, JsonRejection>,
) -> Result<Json<DocumentAnalysis>, ApiError> {
    let Json(request) =
        payload.map_err(|err| ApiError::new(ErrorKind::InvalidRequest, err.body_text()))?;

    // Dropping this handler (client disconnect) drops the analysis future too.
    let cancel = state.shutdown.child_token();
    let analysis = state.analyzer.analyze_url(&request, cancel).await?;
    Ok(Json(analysis))
}

async fn usage_handler(State(state): State<AppState>) -> Json<UsageTotals> {
    Json(state.analyzer.ledger().totals())
}

async fn usage_reset_handler(
    State(state): State<AppState>,
) -> Result<Json<UsageTotals>, ApiError> {
    state.analyzer.ledger().reset().await.map_err(|err| {
        tracing::error!(error = %format!("{err:#}"), "usage reset failed");
        ApiError::new(ErrorKind::Internal, "failed to reset usage ledger")
    })?;
    tracing::info!("usage ledger reset");
    Ok(Json(state.analyzer.ledger().totals()))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt as _;

    use super::*;
    use crate::cache::AnalysisCache;
    use crate::config::AnalyzerConfig;
    use crate::error::LlmError;
    use crate::llm::{ChatRequest, Completion, LlmClient, LlmProvider};
    use crate::usage::{InMemoryLedger, TokenUsageRecord, UsageLedger};
    use crate::validate::UrlValidator;

    struct SilentProvider;

    #[async_trait]
    impl LlmProvider for SilentProvider {
        fn name(&self) -> &str {
            "silent"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<Completion, LlmError> {
            Err(LlmError::Unavailable("not wired in this test".to_owned()))
        }
    }

    async fn state() -> AppState {
        let config = AnalyzerConfig::default();
        let ledger: Arc<dyn UsageLedger> = Arc::new(InMemoryLedger::new());
        let llm = LlmClient::new(&config.llm, Arc::new(SilentProvider), ledger);
        let cache = AnalysisCache::open(&config.cache).await.unwrap();
        let validator = UrlValidator::new(&config.validator);
        let analyzer = Analyzer::new(config, validator, cache, llm).unwrap();
        AppState::new(Arc::new(analyzer))
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let app = router(state().await);
        let resp = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn private_target_is_rejected_with_400() {
        let app = router(state().await);
        let resp = app
            .oneshot(post_json(
                "/v1/analyze",
                r#"{"url":"http://127.0.0.1/admin","analysis_type":"default"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["error"]["kind"], "rejected");
        assert!(body["error"]["message"].as_str().unwrap().contains("private_network"));
    }

    #[tokio::test]
    async fn malformed_body_and_bad_options_are_invalid_requests() {
        let app = router(state().await);
        let resp = app
            .clone()
            .oneshot(post_json("/v1/analyze", r#"{"analysis_type":"default"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"]["kind"], "invalid_request");

        let resp = app
            .oneshot(post_json(
                "/v1/analyze",
                r#"{"url":"https://example.com","options":{"timeout_secs":0}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"]["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn usage_reports_and_resets_totals() {
        let state = state().await;
        state
            .analyzer
            .ledger()
            .record(TokenUsageRecord {
                timestamp: chrono::Utc::now(),
                model: "m".to_owned(),
                prompt_tokens: 10,
                completion_tokens: 5,
                cost: 0.0,
            })
            .await
            .unwrap();
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(Request::get("/v1/usage").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["calls"], 1);
        assert_eq!(body["total_tokens"], 15);

        let resp = app
            .oneshot(post_json("/v1/usage/reset", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["calls"], 0);
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(status_for(ErrorKind::NoContent), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::AllChunksFailed), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::TimedOut), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::Cancelled).as_u16(), 499);
    }
}
