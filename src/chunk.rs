use serde::{Deserialize, Serialize};

use crate::extract::{ExtractedContent, OutlineNode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    /// Enclosing headings at the chunk start, outermost first.
    pub section_path: Vec<String>,
}

/// Splits `extracted.text` into chunks of at most `max_chunk_chars` chars.
///
/// Block boundaries (blank lines) are preferred, and a new chunk starts at a
/// heading once the current one is at least half full. Blocks longer than the
/// limit are split at the last whitespace that fits. Concatenating the chunk
/// texts in order yields the input text unchanged.
pub fn chunk(extracted: &ExtractedContent, max_chunk_chars: usize) -> Vec<Chunk> {
    let max = max_chunk_chars.max(1);
    let text = extracted.text.as_str();
    if text.is_empty() {
        return Vec::new();
    }

    let mut heading_starts = Vec::new();
    collect_heading_starts(&extracted.outline, &mut heading_starts);
    heading_starts.sort_unstable();

    let mut chunks = Vec::new();
    let mut current_start = 0usize;
    let mut current_end = 0usize;
    let mut current_chars = 0usize;

    for (start, end, chars) in pieces(text, max) {
        let at_heading = heading_starts.binary_search(&start).is_ok();
        let overflow = current_chars + chars > max;
        let section_break = at_heading && current_chars * 2 >= max;
        if current_chars > 0 && (overflow || section_break) {
            push_chunk(&mut chunks, extracted, current_start, current_end);
            current_start = start;
            current_chars = 0;
        }
        current_end = end;
        current_chars += chars;
    }
    if current_end > current_start {
        push_chunk(&mut chunks, extracted, current_start, current_end);
    }

    chunks
}

fn push_chunk(chunks: &mut Vec<Chunk>, extracted: &ExtractedContent, start: usize, end: usize) {
    chunks.push(Chunk {
        index: chunks.len(),
        text: extracted.text[start..end].to_owned(),
        section_path: extracted.section_path_at(start),
    });
}

fn collect_heading_starts(nodes: &[OutlineNode], out: &mut Vec<usize>) {
    for node in nodes {
        out.push(node.span.start);
        collect_heading_starts(&node.children, out);
    }
}

/// Byte ranges (with char counts) covering `text` exactly: one per block
/// including its trailing separator. A block that only overflows because of
/// its separator is emitted as body and separator, larger ones are split.
fn pieces(text: &str, max: usize) -> Vec<(usize, usize, usize)> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    for block in text.split_inclusive("\n\n") {
        let block_start = offset;
        offset += block.len();

        let chars = block.chars().count();
        if chars <= max {
            out.push((block_start, offset, chars));
            continue;
        }

        // A paragraph that fits without its separator stays whole.
        let body = block.strip_suffix("\n\n").unwrap_or(block);
        let body_chars = body.chars().count();
        if body.len() < block.len() && body_chars <= max && chars - body_chars <= max {
            out.push((block_start, block_start + body.len(), body_chars));
            out.push((block_start + body.len(), offset, chars - body_chars));
            continue;
        }

        let mut rest = block;
        let mut rest_start = block_start;
        while !rest.is_empty() {
            let cut = split_point(rest, max);
            let piece = &rest[..cut];
            out.push((rest_start, rest_start + cut, piece.chars().count()));
            rest = &rest[cut..];
            rest_start += cut;
        }
    }
    out
}

/// Byte index to cut `s` so the head has at most `max` chars, preferring the
/// position just after the last whitespace.
fn split_point(s: &str, max: usize) -> usize {
    let Some((hard_cut, _)) = s.char_indices().nth(max) else {
        return s.len();
    };
    let head = &s[..hard_cut];
    match head.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
        Some((idx, ws)) if idx > 0 => idx + ws.len_utf8(),
        _ => hard_cut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract;

    fn plain(text: &str) -> ExtractedContent {
        ExtractedContent {
            text: text.to_owned(),
            ..ExtractedContent::default()
        }
    }

    fn joined(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn concatenation_reproduces_text() {
        let text = "alpha beta gamma\n\ndelta epsilon\n\nzeta eta theta iota kappa lambda mu\n\nnu";
        for max in [1, 3, 7, 16, 40, 1000] {
            let chunks = chunk(&plain(text), max);
            assert_eq!(joined(&chunks), text, "max={max}");
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.index, i);
                assert!(c.text.chars().count() <= max, "max={max} chunk={:?}", c.text);
            }
        }
    }

    #[test]
    fn keeps_paragraphs_whole_when_they_fit() {
        let text = "first paragraph\n\nsecond paragraph\n\nthird";
        let chunks = chunk(&plain(text), 36);
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["first paragraph\n\nsecond paragraph\n\n", "third"]);
    }

    #[test]
    fn paragraph_filling_the_limit_is_not_split_by_its_separator() {
        let text = "abc defghi\n\nxyz";
        let chunks = chunk(&plain(text), 10);
        assert_eq!(chunks[0].text, "abc defghi");
        assert_eq!(joined(&chunks), text);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 10));
    }

    #[test]
    fn splits_long_paragraph_on_whitespace() {
        let text = "one two three four five six";
        let chunks = chunk(&plain(text), 10);
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["one two ", "three ", "four five ", "six"]);
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "日本語のテキストを分割します";
        let chunks = chunk(&plain(text), 4);
        assert_eq!(joined(&chunks), text);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 4));
    }

    #[test]
    fn chunks_carry_section_paths() {
        let html = "<html><body><h1>Guide</h1><p>Intro text here.</p>\
            <h2>Install</h2><p>Run the installer and wait.</p>\
            <h2>Usage</h2><p>Call the binary with flags.</p></body></html>";
        let content = extract(html);
        let chunks = chunk(&content, 40);
        assert_eq!(joined(&chunks), content.text);
        let paths: Vec<_> = chunks.iter().map(|c| c.section_path.clone()).collect();
        assert!(paths.contains(&vec!["Guide".to_owned(), "Install".to_owned()]));
        assert!(paths.contains(&vec!["Guide".to_owned(), "Usage".to_owned()]));
        assert_eq!(paths[0], vec!["Guide".to_owned()]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk(&plain(""), 100).is_empty());
    }
}
