//! Paragraph-boundary text chunker.
//!
//! Packs paragraphs (`\n\n`-separated) into chunks of at most
//! `max_tokens * CHARS_PER_TOKEN` characters. Oversized paragraphs are
//! broken at the last newline or space before the limit, never inside a
//! UTF-8 code point. With a non-zero overlap, each chunk after the first is
//! prefixed with the tail of its predecessor so that a phrase straddling a
//! boundary is still searchable.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Rough chars-per-token ratio used for sizing.
const CHARS_PER_TOKEN: usize = 4;

/// [`chunk_text_with_overlap`] without overlap.
#[cfg(test)]
pub(crate) fn chunk_text(document_id: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    chunk_text_with_overlap(document_id, text, max_tokens, 0)
}

/// Split `text` into chunks with contiguous indices starting at 0.
pub fn chunk_text_with_overlap(
    document_id: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let pieces = pack_paragraphs(text, max_chars);

    let mut chunks = Vec::with_capacity(pieces.len().max(1));
    let mut previous: Option<&str> = None;
    for (index, piece) in pieces.iter().enumerate() {
        let body = match previous {
            Some(prev) if overlap_chars > 0 => {
                let tail = tail_on_boundary(prev, overlap_chars);
                if tail.is_empty() {
                    piece.clone()
                } else {
                    format!("{}\n{}", tail, piece)
                }
            }
            _ => piece.clone(),
        };
        chunks.push(make_chunk(document_id, index as i64, &body));
        previous = Some(piece.as_str());
    }

    if chunks.is_empty() {
        chunks.push(make_chunk(document_id, 0, text.trim()));
    }

    chunks
}

fn pack_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let would_be = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };

        if would_be > max_chars && !buf.is_empty() {
            out.push(std::mem::take(&mut buf));
        }

        if para.len() > max_chars {
            split_long(para, max_chars, &mut out);
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }

    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

fn split_long(mut remaining: &str, max_chars: usize, out: &mut Vec<String>) {
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            let piece = remaining.trim();
            if !piece.is_empty() {
                out.push(piece.to_string());
            }
            break;
        }

        let limit = floor_char_boundary(remaining, max_chars);
        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map(|pos| pos + 1)
            .filter(|&pos| pos > 0)
            .unwrap_or(limit);
        // a single code point wider than max_chars still has to advance
        let split_at = if split_at == 0 {
            remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len())
        } else {
            split_at
        };

        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

/// Largest index `<= max` that lies on a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Last `n` bytes of `s`, widened to a char boundary and trimmed to a word start.
fn tail_on_boundary(s: &str, n: usize) -> &str {
    if n >= s.len() {
        return s.trim();
    }
    let mut start = s.len() - n;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    let tail = &s[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) if pos + 1 < tail.len() => tail[pos..].trim(),
        _ => tail.trim(),
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash: hash_text(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_is_one_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 300);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn empty_text_still_yields_a_chunk() {
        let chunks = chunk_text("doc1", "", 300);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "");
    }

    #[test]
    fn paragraphs_pack_until_limit() {
        // max_tokens=5 => 20 chars
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_text("doc1", text, 5);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert!(!c.text.is_empty());
        }

        let one = chunk_text("doc1", "Human: hi\n\nAssistant: hello", 300);
        assert_eq!(one.len(), 1);
        assert!(one[0].text.contains("Human: hi\n\nAssistant: hello"));
    }

    #[test]
    fn long_paragraph_splits_on_spaces() {
        let text = "word ".repeat(100);
        let chunks = chunk_text("doc1", &text, 5);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.len() <= 20, "chunk too long: {:?}", c.text);
            assert!(!c.text.starts_with(' '));
        }
    }

    #[test]
    fn multibyte_text_never_panics() {
        let text = "日本語のテキスト".repeat(40);
        let chunks = chunk_text("doc1", &text, 3);
        assert!(chunks.len() > 1);
        let rejoined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rejoined, text);
    }

    #[test]
    fn deterministic_text_and_hashes() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let a = chunk_text("doc1", text, 2);
        let b = chunk_text("doc1", text, 2);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.hash, y.hash);
        }
    }

    #[test]
    fn overlap_carries_previous_tail() {
        let text = "first paragraph with words\n\nsecond paragraph with words";
        let chunks = chunk_text_with_overlap("doc1", text, 7, 2);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].text.ends_with("second paragraph with words"));
        assert!(chunks[1].text.contains("words\n"));
    }
}
