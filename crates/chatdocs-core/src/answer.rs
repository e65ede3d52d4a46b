//! Query answers and their markdown rendering.
//!
//! Both query modes produce an [`Answer`]; [`Answer::to_markdown`] renders
//! the single message sent back to the client: a `## Response` section and,
//! when there are citations, a `## Sources` section.

use serde::Serialize;

use crate::models::ScoredPassage;

/// Maximum characters of passage text shown per cited source.
pub const SOURCE_SNIPPET_CHARS: usize = 350;

/// Wrap a user question in the instruction that asks for markdown output.
pub fn markdown_request(question: &str) -> String {
    format!(
        "Please return a nicely formatted markdown string to this request:\n{}",
        question.trim()
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<ScoredPassage>,
}

impl Answer {
    pub fn to_markdown(&self) -> String {
        let mut out = format!("## Response\n\n{}\n\n", self.text.trim());
        if !self.sources.is_empty() {
            out.push_str("## Sources\n\n");
            out.push_str(&format_sources(&self.sources));
        }
        out
    }
}

/// One quoted block per source, separated by blank lines.
pub fn format_sources(sources: &[ScoredPassage]) -> String {
    sources
        .iter()
        .map(|s| {
            format!(
                "> Source (Doc id: {}, file: {}): {}",
                s.id,
                s.file_name,
                snippet(&s.text, SOURCE_SNIPPET_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
