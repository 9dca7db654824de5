use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    #[default]
    Default,
    Detailed,
}

impl AnalysisType {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisType::Default => "default",
            AnalysisType::Detailed => "detailed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    #[default]
    Neutral,
}

impl Sentiment {
    /// Accepts labels ("Positive", "mostly negative") and polarity scores.
    pub fn parse_loose(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        if let Ok(score) = raw.parse::<f64>() {
            return Some(Self::from_polarity(score));
        }
        if raw.contains("positive") {
            Some(Sentiment::Positive)
        } else if raw.contains("negative") {
            Some(Sentiment::Negative)
        } else if raw.contains("neutral") || raw.contains("mixed") {
            Some(Sentiment::Neutral)
        } else {
            None
        }
    }

    pub fn from_polarity(score: f64) -> Self {
        if score > 0.1 {
            Sentiment::Positive
        } else if score < -0.1 {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub summary: String,
    pub key_points: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub sentiment: Sentiment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seo_analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readability: Option<String>,
    #[serde(default)]
    pub raw_model_output: String,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flag_reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub url: String,
    #[serde(default)]
    pub analysis_type: AnalysisType,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl AnalysisRequest {
    pub fn new(url: impl Into<String>, analysis_type: AnalysisType) -> Self {
        Self {
            url: url.into(),
            analysis_type,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.options.insert(key.to_owned(), value);
        self
    }
}

/// Typed view of `AnalysisRequest::options`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisOptions {
    pub timeout: Option<Duration>,
    pub max_chunk_chars: Option<usize>,
    pub bypass_cache: bool,
}

impl AnalysisOptions {
    pub fn from_map(options: &BTreeMap<String, serde_json::Value>) -> Result<Self, String> {
        let mut out = Self::default();
        for (key, value) in options {
            match key.as_str() {
                "timeout_secs" => {
                    let secs = value
                        .as_u64()
                        .filter(|s| *s > 0)
                        .ok_or_else(|| {
                            format!("option `timeout_secs` must be a positive integer, got {value}")
                        })?;
                    out.timeout = Some(Duration::from_secs(secs));
                }
                "max_chunk_chars" => {
                    let max = value
                        .as_u64()
                        .filter(|m| *m >= 100)
                        .ok_or_else(|| {
                            format!(
                                "option `max_chunk_chars` must be an integer >= 100, got {value}"
                            )
                        })?;
                    out.max_chunk_chars = Some(max as usize);
                }
                "bypass_cache" => {
                    out.bypass_cache = value
                        .as_bool()
                        .ok_or_else(|| {
                            format!("option `bypass_cache` must be a boolean, got {value}")
                        })?;
                }
                other => {
                    tracing::debug!(option = other, "ignoring unknown analysis option");
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Another in-flight request computed the result.
    Coalesced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentAnalysis {
    pub request_id: String,
    pub url: String,
    pub final_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub analysis_type: AnalysisType,
    pub result: AnalysisResult,
    pub chunks_total: usize,
    pub chunks_failed: Vec<usize>,
    pub cache: CacheStatus,
    pub elapsed_ms: u64,
}
