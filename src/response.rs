//! Turns raw model output into a checked [`AnalysisResult`].

use serde_json::Value;

use crate::config::SafetyMode;
use crate::error::ValidationFailure;
use crate::model::{AnalysisResult, AnalysisType, Sentiment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedSchema {
    pub require_topics: bool,
}

impl ExpectedSchema {
    pub fn for_type(analysis_type: AnalysisType) -> Self {
        Self {
            require_topics: analysis_type == AnalysisType::Detailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelVerdict {
    Valid(AnalysisResult),
    /// Usable but tripped the safety filter; `flagged` is set on the result.
    Flagged(AnalysisResult),
    Malformed(ValidationFailure),
}

const NON_ANSWERS: &[&str] = &[
    "i cannot provide",
    "i can't provide",
    "i cannot help",
    "i can't help",
    "i cannot assist",
    "i can't assist",
    "i'm unable to",
    "i am unable to",
    "i'm sorry, but",
    "i am sorry, but",
    "as an ai",
    "as a language model",
];

const INJECTION_ECHOES: &[&str] = &[
    "ignore previous instructions",
    "ignore all previous instructions",
    "ignore the above instructions",
    "disregard previous instructions",
    "disregard the above",
    "reveal your system prompt",
];

const SCRIPT_PAYLOADS: &[&str] = &["<script", "javascript:", "onerror=", "onload=", "<iframe"];

/// Extracts and checks structure, required fields, and non-answers.
pub fn validate_and_parse(
    raw: &str,
    schema: &ExpectedSchema,
) -> Result<AnalysisResult, ValidationFailure> {
    let parsed = match extract_json(raw) {
        Some(value) => from_json(&value),
        None => parse_sections(raw),
    };
    let Some(mut result) = parsed else {
        return Err(if is_non_answer(raw) {
            ValidationFailure::NonAnswer
        } else {
            ValidationFailure::NoStructuredContent
        });
    };

    if is_non_answer(&result.summary) {
        return Err(ValidationFailure::NonAnswer);
    }
    if result.summary.trim().is_empty() {
        return Err(ValidationFailure::MissingField("summary"));
    }
    if result.key_points.is_empty() {
        return Err(ValidationFailure::MissingField("key_points"));
    }
    if schema.require_topics && result.topics.is_empty() {
        return Err(ValidationFailure::MissingField("topics"));
    }

    result.raw_model_output = raw.to_owned();
    Ok(result)
}

pub fn classify(raw: &str, schema: &ExpectedSchema, safety_mode: SafetyMode) -> ModelVerdict {
    let mut result = match validate_and_parse(raw, schema) {
        Ok(result) => result,
        Err(failure) => return ModelVerdict::Malformed(failure),
    };

    let reasons = safety_findings(raw);
    if reasons.is_empty() {
        return ModelVerdict::Valid(result);
    }
    match safety_mode {
        SafetyMode::Discard => {
            ModelVerdict::Malformed(ValidationFailure::Unsafe(reasons.join(", ")))
        }
        SafetyMode::Flag => {
            result.flagged = true;
            result.flag_reasons = reasons;
            ModelVerdict::Flagged(result)
        }
    }
}

fn is_non_answer(text: &str) -> bool {
    let head: String = text.trim().chars().take(200).collect::<String>().to_lowercase();
    let head = head.replace('\u{2019}', "'");
    NON_ANSWERS.iter().any(|phrase| head.contains(phrase))
}

/// Safety categories found in `raw`, in a fixed order.
pub fn safety_findings(raw: &str) -> Vec<String> {
    let lower = raw.to_lowercase();
    let mut reasons = Vec::new();
    if INJECTION_ECHOES.iter().any(|p| lower.contains(p)) {
        reasons.push("prompt_injection_echo".to_owned());
    }
    if SCRIPT_PAYLOADS.iter().any(|p| lower.contains(p)) {
        reasons.push("script_payload".to_owned());
    }
    if contains_credential(raw) {
        reasons.push("credential_leak".to_owned());
    }
    reasons
}

fn contains_credential(raw: &str) -> bool {
    if raw.contains("-----BEGIN") && raw.contains("PRIVATE KEY-----") {
        return true;
    }
    raw.split(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .any(|token| {
            let openai = token.strip_prefix("sk-").is_some_and(|rest| rest.len() >= 20);
            let aws = token.len() == 20
                && token.starts_with("AKIA")
                && token[4..]
                    .bytes()
                    .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
            let github = ["ghp_", "gho_", "ghs_"]
                .iter()
                .any(|p| token.strip_prefix(p).is_some_and(|rest| rest.len() >= 30));
            openai || aws || github
        })
}

/// First JSON object in `raw`: a fenced block, then any balanced `{...}`, then
/// the whole text.
fn extract_json(raw: &str) -> Option<Value> {
    fenced_blocks(raw)
        .into_iter()
        .chain(balanced_objects(raw))
        .chain(std::iter::once(raw.trim()))
        .find_map(|candidate| {
            serde_json::from_str::<Value>(candidate)
                .ok()
                .filter(Value::is_object)
        })
}

fn fenced_blocks(raw: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let lang = after[..body_start].trim().to_ascii_lowercase();
        let body = &after[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        if lang.is_empty() || lang == "json" {
            out.push(body[..close].trim());
        }
        rest = &body[close + 3..];
    }
    out
}

/// Top-level `{...}` spans, skipping braces inside JSON strings.
fn balanced_objects(raw: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, c) in raw.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0
                    && let Some(s) = start.take()
                {
                    out.push(&raw[s..=idx]);
                }
            }
            _ => {}
        }
    }
    out
}

fn from_json(value: &Value) -> Option<AnalysisResult> {
    let obj = value.as_object()?;
    let field = |names: &[&str]| names.iter().find_map(|n| obj.get(*n));

    let summary = field(&["summary", "Summary"])
        .map(text_of)
        .unwrap_or_default();
    Some(AnalysisResult {
        summary: summary.trim().to_owned(),
        key_points: field(&["key_points", "keyPoints", "key points"])
            .map(list_of)
            .unwrap_or_default(),
        topics: field(&["topics", "Topics"]).map(list_of).unwrap_or_default(),
        sentiment: field(&["sentiment", "Sentiment"])
            .and_then(sentiment_of)
            .unwrap_or_default(),
        seo_analysis: field(&["seo_analysis", "seo", "seoAnalysis"])
            .map(text_of)
            .filter(|s| !s.trim().is_empty()),
        readability: field(&["readability", "Readability"])
            .map(text_of)
            .filter(|s| !s.trim().is_empty()),
        ..AnalysisResult::default()
    })
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(text_of).collect::<Vec<_>>().join("\n"),
        other => other.to_string(),
    }
}

fn list_of(value: &Value) -> Vec<String> {
    let items = match value {
        Value::Array(items) => items.iter().map(text_of).collect(),
        Value::String(s) => s.lines().map(str::to_owned).collect(),
        _ => Vec::new(),
    };
    items
        .into_iter()
        .map(|item: String| strip_bullet(&item).to_owned())
        .filter(|item| !item.is_empty())
        .collect()
}

fn sentiment_of(value: &Value) -> Option<Sentiment> {
    match value {
        Value::String(s) => Sentiment::parse_loose(s),
        Value::Number(n) => n.as_f64().map(Sentiment::from_polarity),
        Value::Object(obj) => ["label", "overall", "value", "score"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(sentiment_of)),
        _ => None,
    }
}

fn strip_bullet(line: &str) -> &str {
    let line = line.trim();
    let line = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("• "))
        .unwrap_or(line);
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    if digits > 0
        && let Some(rest) = line[digits..]
            .strip_prefix(". ")
            .or_else(|| line[digits..].strip_prefix(") "))
    {
        return rest.trim();
    }
    line.trim()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Header {
    Summary,
    KeyPoints,
    Topics,
    Sentiment,
    Seo,
    Readability,
}

fn header_of(line: &str) -> Option<(Header, &str)> {
    let trimmed = line.trim().trim_start_matches(['#', '*', ' ']);
    let (label, rest) = trimmed.split_once(':')?;
    let label = label.trim().trim_end_matches('*').trim().to_ascii_lowercase();
    let header = match label.as_str() {
        "summary" => Header::Summary,
        "key points" | "key_points" | "keypoints" => Header::KeyPoints,
        "topics" => Header::Topics,
        "sentiment" => Header::Sentiment,
        "seo" | "seo analysis" | "seo_analysis" => Header::Seo,
        "readability" => Header::Readability,
        _ => return None,
    };
    Some((header, rest.trim_start_matches('*').trim()))
}

/// Fallback for prose answers laid out as `Summary:` / `Key points:` blocks.
fn parse_sections(raw: &str) -> Option<AnalysisResult> {
    let mut sections: Vec<(Header, Vec<&str>)> = Vec::new();
    for line in raw.lines() {
        if let Some((header, rest)) = header_of(line) {
            sections.push((header, Vec::new()));
            if let Some((_, lines)) = sections.last_mut()
                && !rest.is_empty()
            {
                lines.push(rest);
            }
        } else if let Some((_, lines)) = sections.last_mut()
            && !line.trim().is_empty()
        {
            lines.push(line);
        }
    }
    if sections.is_empty() {
        return None;
    }

    let mut result = AnalysisResult::default();
    for (header, lines) in sections {
        let joined = lines.iter().map(|l| l.trim()).collect::<Vec<_>>().join(" ");
        let items = || {
            lines
                .iter()
                .flat_map(|l| {
                    if header == Header::Topics && !l.trim_start().starts_with(['-', '*']) {
                        l.split(',').map(str::trim).collect::<Vec<_>>()
                    } else {
                        vec![strip_bullet(l)]
                    }
                })
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect::<Vec<_>>()
        };
        match header {
            Header::Summary => result.summary = joined,
            Header::KeyPoints => result.key_points = items(),
            Header::Topics => result.topics = items(),
            Header::Sentiment => {
                result.sentiment = Sentiment::parse_loose(&joined).unwrap_or_default();
            }
            Header::Seo => result.seo_analysis = Some(joined).filter(|s| !s.is_empty()),
            Header::Readability => result.readability = Some(joined).filter(|s| !s.is_empty()),
        }
    }
    Some(result)
}
