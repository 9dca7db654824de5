use std::ops::Range;

use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};

const BLOCK_SELECTOR: &str = "h1, h2, h3, h4, h5, h6, p, li, blockquote, pre";

/// Containers whose text is navigation or chrome rather than content.
const BOILERPLATE_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "nav", "footer", "header", "aside", "form",
    "iframe", "svg",
];

const BLOCK_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "blockquote", "pre",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineNode {
    pub heading: String,
    pub level: u8,
    /// Byte range of `ExtractedContent::text` covered by this heading.
    pub span: Range<usize>,
    pub children: Vec<OutlineNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub title: Option<String>,
    pub text: String,
    pub outline: Vec<OutlineNode>,
    pub language: Option<String>,
}

impl ExtractedContent {
    /// Headings enclosing `offset`, outermost first.
    pub fn section_path_at(&self, offset: usize) -> Vec<String> {
        let mut path = Vec::new();
        let mut nodes = self.outline.as_slice();
        while let Some(node) = nodes.iter().find(|n| n.span.contains(&offset)) {
            path.push(node.heading.clone());
            nodes = node.children.as_slice();
        }
        path
    }
}

#[derive(Debug)]
struct Block {
    heading_level: Option<u8>,
    text: String,
}

pub fn extract(html: &str) -> ExtractedContent {
    let doc = Html::parse_document(html);

    let blocks = collect_blocks(&doc);
    let has_body_text = blocks.iter().any(|b| b.heading_level.is_none());

    let title = select_first_text(&doc, "title").or_else(|| {
        blocks
            .iter()
            .find(|b| b.heading_level == Some(1))
            .map(|b| b.text.clone())
    });
    let language = document_language(&doc);

    if !has_body_text {
        tracing::debug!(
            blocks = blocks.len(),
            "no paragraph-like blocks; falling back to whole-document text"
        );
        return ExtractedContent {
            title,
            text: whole_document_text(&doc),
            outline: Vec::new(),
            language,
        };
    }

    let mut text = String::new();
    let mut headings: Vec<(u8, String, usize)> = Vec::new();
    for block in &blocks {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        if let Some(level) = block.heading_level {
            headings.push((level, block.text.clone(), text.len()));
        }
        text.push_str(&block.text);
    }

    let outline = build_outline(&headings, text.len());
    ExtractedContent {
        title,
        text,
        outline,
        language,
    }
}

fn collect_blocks(doc: &Html) -> Vec<Block> {
    let Ok(selector) = Selector::parse(BLOCK_SELECTOR) else {
        return Vec::new();
    };

    let mut blocks = Vec::new();
    for el in doc.select(&selector) {
        if has_ancestor_in(el, BOILERPLATE_TAGS) || has_ancestor_in(el, BLOCK_TAGS) {
            continue;
        }
        let text = visible_text(el);
        if text.is_empty() {
            continue;
        }
        let name = el.value().name();
        let heading_level = name
            .strip_prefix('h')
            .and_then(|n| n.parse::<u8>().ok())
            .filter(|n| (1..=6).contains(n));
        blocks.push(Block {
            heading_level,
            text,
        });
    }
    blocks
}

fn has_ancestor_in(el: ElementRef<'_>, tags: &[&str]) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|anc| tags.contains(&anc.value().name()))
}

/// Whitespace-normalized text under `el`, skipping boilerplate subtrees.
fn visible_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    for node in el.descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .take_while(|anc| anc.id() != el.id())
            .filter_map(ElementRef::wrap)
            .any(|anc| BOILERPLATE_TAGS.contains(&anc.value().name()));
        if hidden {
            continue;
        }
        out.push(' ');
        out.push_str(text);
    }
    normalize_whitespace(&out)
}

fn whole_document_text(doc: &Html) -> String {
    let body = Selector::parse("body")
        .ok()
        .and_then(|sel| doc.select(&sel).next());
    visible_text(body.unwrap_or_else(|| doc.root_element()))
}

fn select_first_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let el = doc.select(&sel).next()?;
    let text = normalize_whitespace(&el.text().collect::<Vec<_>>().join(" "));
    (!text.is_empty()).then_some(text)
}

fn document_language(doc: &Html) -> Option<String> {
    let lang = doc.root_element().value().attr("lang")?;
    let primary = lang.split(['-', '_']).next()?.trim().to_ascii_lowercase();
    (!primary.is_empty() && primary.chars().all(|c| c.is_ascii_alphabetic())).then_some(primary)
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Each heading covers the text up to the next heading of the same or a
/// higher level.
fn build_outline(headings: &[(u8, String, usize)], text_len: usize) -> Vec<OutlineNode> {
    let flat: Vec<OutlineNode> = headings
        .iter()
        .enumerate()
        .map(|(idx, (level, heading, start))| {
            let end = headings[idx + 1..]
                .iter()
                .find(|(next_level, _, _)| next_level <= level)
                .map(|(_, _, next_start)| *next_start)
                .unwrap_or(text_len);
            OutlineNode {
                heading: heading.clone(),
                level: *level,
                span: *start..end,
                children: Vec::new(),
            }
        })
        .collect();

    let mut roots: Vec<OutlineNode> = Vec::new();
    let mut stack: Vec<OutlineNode> = Vec::new();
    for node in flat {
        while stack.last().is_some_and(|top| top.level >= node.level) {
            if let Some(done) = stack.pop() {
                attach(&mut stack, &mut roots, done);
            }
        }
        stack.push(node);
    }
    while let Some(done) = stack.pop() {
        attach(&mut stack, &mut roots, done);
    }
    roots
}

fn attach(stack: &mut [OutlineNode], roots: &mut Vec<OutlineNode>, node: OutlineNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => roots.push(node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE: &str = r#"<!doctype html>
<html lang="en-US">
  <head><title>Field Notes</title><style>p { color: red }</style></head>
  <body>
    <nav><ul><li>Home</li><li>About</li></ul></nav>
    <h1>Field Notes</h1>
    <p>Intro   paragraph
       with wrapped text.</p>
    <h2>Birds</h2>
    <p>Sparrows are common.</p>
    <ul><li><p>Robin</p></li><li>Wren</li></ul>
    <h2>Trees</h2>
    <p>Oaks grow slowly.<script>track()</script></p>
    <footer><p>Copyright 2024</p></footer>
  </body>
</html>"#;

    #[test]
    fn extracts_text_bearing_blocks_only() {
        let content = extract(ARTICLE);
        assert_eq!(content.title.as_deref(), Some("Field Notes"));
        assert_eq!(content.language.as_deref(), Some("en"));
        assert_eq!(
            content.text,
            "Field Notes\n\nIntro paragraph with wrapped text.\n\nBirds\n\n\
             Sparrows are common.\n\nRobin\n\nWren\n\nTrees\n\nOaks grow slowly."
        );
        assert!(!content.text.contains("Home"));
        assert!(!content.text.contains("Copyright"));
        assert!(!content.text.contains("track"));
    }

    #[test]
    fn outline_nests_headings_with_spans() {
        let content = extract(ARTICLE);
        assert_eq!(content.outline.len(), 1);
        let root = &content.outline[0];
        assert_eq!(root.heading, "Field Notes");
        assert_eq!(root.span, 0..content.text.len());
        let children: Vec<_> = root.children.iter().map(|c| c.heading.as_str()).collect();
        assert_eq!(children, ["Birds", "Trees"]);

        let birds = &root.children[0];
        assert!(content.text[birds.span.clone()].starts_with("Birds"));
        assert!(content.text[birds.span.clone()].contains("Wren"));
        assert!(!content.text[birds.span.clone()].contains("Oaks"));

        let oaks = content.text.find("Oaks").unwrap();
        assert_eq!(content.section_path_at(oaks), ["Field Notes", "Trees"]);
    }

    #[test]
    fn falls_back_to_document_text_without_paragraphs() {
        let html =
            "<html><body><div>Just a <b>div</b> page</div><script>x()</script></body></html>";
        let content = extract(html);
        assert_eq!(content.text, "Just a div page");
        assert!(content.outline.is_empty());
    }

    #[test]
    fn never_fails_on_garbage() {
        let content = extract("<<<>>> <p>unclosed <b>tags");
        assert!(content.text.contains("unclosed tags"));
        assert_eq!(extract("").text, "");
    }
}
