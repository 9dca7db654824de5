use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Inserted where text was cut out of a section.
pub const TRIM_MARKER: &str = "\n[...]\n";

const CHARS_PER_TOKEN: usize = 4;

/// Rough token count: one token per four chars, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSection {
    pub name: String,
    pub body: String,
    /// Non-essential sections are dropped before essential ones are trimmed.
    pub essential: bool,
}

impl PromptSection {
    pub fn essential(name: &str, body: impl Into<String>) -> Self {
        Self {
            name: name.to_owned(),
            body: body.into(),
            essential: true,
        }
    }

    pub fn optional(name: &str, body: impl Into<String>) -> Self {
        Self {
            name: name.to_owned(),
            body: body.into(),
            essential: false,
        }
    }

    fn render_into(&self, out: &mut String) {
        if !self.name.is_empty() {
            out.push_str("## ");
            out.push_str(&self.name);
            out.push('\n');
        }
        out.push_str(&self.body);
    }
}

/// A system instruction plus named user-message sections. Instructions are
/// never trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub sections: Vec<PromptSection>,
}

impl Prompt {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            sections: Vec::new(),
        }
    }

    pub fn section(mut self, section: PromptSection) -> Self {
        self.sections.push(section);
        self
    }

    pub fn user_text(&self) -> String {
        let mut out = String::new();
        for (idx, section) in self.sections.iter().enumerate() {
            if idx > 0 {
                out.push_str("\n\n");
            }
            section.render_into(&mut out);
        }
        out
    }

    pub fn estimated_tokens(&self) -> usize {
        self.total_chars().div_ceil(CHARS_PER_TOKEN)
    }

    fn total_chars(&self) -> usize {
        self.system.chars().count() + self.user_text().chars().count()
    }
}

/// Returns `prompt` trimmed so its estimate fits `limit` tokens.
///
/// Non-essential sections go first, middle-most first. Then the largest
/// essential section loses text from its middle (head and tail are kept)
/// until the prompt fits. Fails only when the instructions and section
/// headers alone cannot fit.
pub fn fit_to_budget(prompt: &Prompt, limit: usize) -> Result<Prompt, LlmError> {
    if prompt.estimated_tokens() <= limit {
        return Ok(prompt.clone());
    }
    let budget_chars = limit * CHARS_PER_TOKEN;
    let marker_chars = TRIM_MARKER.chars().count();

    let skeleton = Prompt {
        system: prompt.system.clone(),
        sections: prompt
            .sections
            .iter()
            .filter(|s| s.essential)
            .map(|s| PromptSection {
                body: String::new(),
                ..s.clone()
            })
            .collect(),
    };
    let essential_count = skeleton.sections.len();
    if skeleton.total_chars() + marker_chars * essential_count > budget_chars {
        return Err(LlmError::BudgetExceeded(format!(
            "instructions need ~{} tokens but the model input limit is {limit}",
            skeleton.estimated_tokens()
        )));
    }

    let mut fitted = prompt.clone();
    let mut dropped = 0usize;
    while fitted.total_chars() > budget_chars {
        let optional: Vec<usize> = fitted
            .sections
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.essential)
            .map(|(idx, _)| idx)
            .collect();
        if optional.is_empty() {
            break;
        }
        fitted.sections.remove(optional[optional.len() / 2]);
        dropped += 1;
    }

    let mut trimmed = 0usize;
    while fitted.total_chars() > budget_chars {
        let excess = fitted.total_chars() - budget_chars;
        let Some(idx) = largest_trimmable(&fitted) else {
            break;
        };
        let body = &fitted.sections[idx].body;
        fitted.sections[idx].body = cut_middle(body, excess + marker_chars);
        trimmed += 1;
    }

    if fitted.total_chars() > budget_chars {
        return Err(LlmError::BudgetExceeded(format!(
            "prompt needs ~{} tokens after trimming; limit is {limit}",
            fitted.estimated_tokens()
        )));
    }

    tracing::info!(
        original_tokens = prompt.estimated_tokens(),
        fitted_tokens = fitted.estimated_tokens(),
        limit,
        dropped_sections = dropped,
        trimmed_sections = trimmed,
        "prompt trimmed to fit model input limit"
    );
    Ok(fitted)
}

/// Index of the essential section with the longest body that can still lose
/// text.
fn largest_trimmable(prompt: &Prompt) -> Option<usize> {
    prompt
        .sections
        .iter()
        .enumerate()
        .filter(|(_, s)| s.essential && s.body != TRIM_MARKER && !s.body.is_empty())
        .max_by_key(|(idx, s)| (s.body.chars().count(), std::cmp::Reverse(*idx)))
        .map(|(idx, _)| idx)
}

/// Removes at least `remove` chars from the middle of `body`, replacing them
/// with [`TRIM_MARKER`]. The head keeps the extra char on odd splits.
fn cut_middle(body: &str, remove: usize) -> String {
    let total = body.chars().count();
    if remove >= total {
        return TRIM_MARKER.to_owned();
    }
    let keep = total - remove;
    let head_chars = keep.div_ceil(2);
    let tail_chars = keep - head_chars;

    let mut out = String::with_capacity(keep + TRIM_MARKER.len());
    out.extend(body.chars().take(head_chars));
    out.push_str(TRIM_MARKER);
    out.extend(body.chars().skip(total - tail_chars));
    out
}
