//! Paragraph-packing passage chunker.
//!
//! Splits a document's text into [`Passage`]s no longer than a token
//! budget. Paragraphs (separated by blank lines) are packed greedily;
//! a paragraph that is larger than the budget on its own is cut at
//! whitespace. Optionally, trailing paragraphs of one passage are repeated
//! at the start of the next (`overlap_tokens`).
//!
//! Token counts are approximated as 4 characters per token.
//!
//! ```rust
//! use chatdocs_core::chunk::chunk_document;
//!
//! let passages = chunk_document(7, "notes.md", "Alpha.\n\nBeta.", 512, 0);
//! assert_eq!(passages.len(), 1);
//! assert_eq!(passages[0].id, "7:0");
//! ```

use sha2::{Digest, Sha256};

use crate::models::Passage;

const CHARS_PER_TOKEN: usize = 4;
const PARAGRAPH_SEP: &str = "\n\n";

/// Chunk `text` belonging to document `document_id` into passages.
///
/// Whitespace-only text yields no passages. Passage indices are
/// contiguous from 0 and ids are `{document_id}:{index}`.
pub fn chunk_document(
    document_id: i64,
    file_name: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Passage> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens.min(max_tokens.saturating_sub(1)) * CHARS_PER_TOKEN;

    let mut passages = Vec::new();
    let mut window: Vec<&str> = Vec::new();

    for unit in split_units(text, max_chars) {
        if !window.is_empty() && joined_len(&window) + PARAGRAPH_SEP.len() + unit.len() > max_chars {
            let index = passages.len() as i64;
            passages.push(make_passage(document_id, file_name, index, &window.join(PARAGRAPH_SEP)));
            window = carry_over(&window, overlap_chars);
            if !window.is_empty()
                && joined_len(&window) + PARAGRAPH_SEP.len() + unit.len() > max_chars
            {
                window.clear();
            }
        }
        window.push(unit);
    }

    if !window.is_empty() {
        let index = passages.len() as i64;
        passages.push(make_passage(document_id, file_name, index, &window.join(PARAGRAPH_SEP)));
    }

    passages
}

/// Paragraphs of `text`, with oversized paragraphs cut into pieces that fit.
fn split_units(text: &str, max_chars: usize) -> Vec<&str> {
    text.split(PARAGRAPH_SEP)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .flat_map(|p| split_long(p, max_chars))
        .collect()
}

fn split_long(paragraph: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = paragraph;
    while rest.len() > max_chars {
        let mut cut = max_chars;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // A single character wider than the budget.
            cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let cut = match rest[..cut].rfind(char::is_whitespace) {
            Some(pos) if pos > 0 => pos,
            _ => cut,
        };
        pieces.push(rest[..cut].trim_end());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

fn joined_len(units: &[&str]) -> usize {
    let text: usize = units.iter().map(|u| u.len()).sum();
    text + PARAGRAPH_SEP.len() * units.len().saturating_sub(1)
}

/// Trailing units of `window` whose joined length fits in `budget`.
fn carry_over<'a>(window: &[&'a str], budget: usize) -> Vec<&'a str> {
    if budget == 0 {
        return Vec::new();
    }
    let mut kept = Vec::new();
    for unit in window.iter().rev() {
        let next_len = joined_len(&kept) + unit.len() + if kept.is_empty() { 0 } else { PARAGRAPH_SEP.len() };
        if next_len > budget {
            break;
        }
        kept.push(*unit);
    }
    kept.reverse();
    // Repeating the whole window would loop forever on the same content.
    if kept.len() == window.len() {
        kept.remove(0);
    }
    kept
}

fn make_passage(document_id: i64, file_name: &str, index: i64, text: &str) -> Passage {
    let hash = hex::encode(Sha256::digest(text.as_bytes()));
    Passage {
        id: format!("{}:{}", document_id, index),
        document_id,
        file_name: file_name.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
