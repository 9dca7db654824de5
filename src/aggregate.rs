use std::collections::HashSet;

use crate::model::{AnalysisResult, Sentiment};

/// One successful chunk, as fed to [`aggregate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkAnalysis {
    pub index: usize,
    /// Chunk length in chars; weights the sentiment tie-break.
    pub chars: usize,
    pub result: AnalysisResult,
}

/// Merges chunk results in chunk order. Returns `None` when `parts` is empty.
///
/// Sentiment is a majority vote over chunks. Ties go to the label with more
/// total chunk text, then to neutral.
pub fn aggregate(parts: &[ChunkAnalysis]) -> Option<AnalysisResult> {
    if parts.is_empty() {
        return None;
    }
    let mut ordered: Vec<&ChunkAnalysis> = parts.iter().collect();
    ordered.sort_by_key(|p| p.index);

    let summary = ordered
        .iter()
        .map(|p| p.result.summary.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let key_points = dedup(ordered.iter().flat_map(|p| p.result.key_points.iter()));
    let topics = dedup(ordered.iter().flat_map(|p| p.result.topics.iter()));

    let seo_analysis = ordered.iter().find_map(|p| p.result.seo_analysis.clone());
    let readability = ordered.iter().find_map(|p| p.result.readability.clone());

    let flagged = ordered.iter().any(|p| p.result.flagged);
    let flag_reasons = dedup(ordered.iter().flat_map(|p| p.result.flag_reasons.iter()));

    let raw_model_output = ordered
        .iter()
        .map(|p| p.result.raw_model_output.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    Some(AnalysisResult {
        summary,
        key_points,
        topics,
        sentiment: vote(&ordered),
        seo_analysis,
        readability,
        raw_model_output,
        flagged,
        flag_reasons,
    })
}

fn vote(parts: &[&ChunkAnalysis]) -> Sentiment {
    const LABELS: [Sentiment; 3] = [Sentiment::Positive, Sentiment::Negative, Sentiment::Neutral];

    let tally = LABELS.map(|label| {
        let matching = parts.iter().filter(|p| p.result.sentiment == label);
        let votes = matching.clone().count();
        let weight: usize = matching.map(|p| p.chars).sum();
        (label, votes, weight)
    });

    let best_votes = tally.iter().map(|(_, v, _)| *v).max().unwrap_or(0);
    let leaders: Vec<_> = tally.iter().filter(|(_, v, _)| *v == best_votes).collect();
    if let [(label, _, _)] = leaders.as_slice() {
        return *label;
    }

    let best_weight = leaders.iter().map(|(_, _, w)| *w).max().unwrap_or(0);
    let heaviest: Vec<_> = leaders
        .iter()
        .filter(|(_, _, w)| *w == best_weight)
        .collect();
    match heaviest.as_slice() {
        [(label, _, _)] => *label,
        _ => Sentiment::Neutral,
    }
}

/// Keeps the first spelling of each item, comparing case- and
/// whitespace-insensitively.
fn dedup<'a>(items: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            continue;
        }
        let norm = trimmed
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if seen.insert(norm) {
            out.push(trimmed.to_owned());
        }
    }
    out
}
