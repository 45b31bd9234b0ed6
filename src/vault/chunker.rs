//! Deterministic text splitting for embedding.
//!
//! Paragraphs (runs separated by blank lines) are packed greedily into chunks
//! of at most `chunk_size` characters. A paragraph longer than the limit is
//! cut at the last whitespace before the limit, or hard at a char boundary
//! when there is none. Same content and same `chunk_size` always produce the
//! same chunks, which keeps chunk ids stable across passes.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    /// Byte offset of the chunk's first character in the source text
    pub start: usize,
    pub text: String,
}

fn paragraph_break() -> &'static Regex {
    static BREAK: OnceLock<Regex> = OnceLock::new();
    BREAK.get_or_init(|| Regex::new(r"\n[ \t]*\r?\n(?:[ \t]*\r?\n)*").expect("static regex"))
}

/// (start, end) byte spans of the non-blank paragraphs in `text`.
fn paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    for sep in paragraph_break().find_iter(text) {
        push_trimmed(text, cursor, sep.start(), &mut spans);
        cursor = sep.end();
    }
    push_trimmed(text, cursor, text.len(), &mut spans);
    spans
}

fn push_trimmed(text: &str, start: usize, end: usize, spans: &mut Vec<(usize, usize)>) {
    let slice = &text[start..end];
    let leading = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim();
    if !trimmed.is_empty() {
        let s = start + leading;
        spans.push((s, s + trimmed.len()));
    }
}

/// Byte index after at most `max_chars` characters of `text[start..end]`.
fn char_limit(text: &str, start: usize, end: usize, max_chars: usize) -> usize {
    text[start..end]
        .char_indices()
        .nth(max_chars)
        .map(|(offset, _)| start + offset)
        .unwrap_or(end)
}

/// Splits one oversized paragraph into pieces of at most `max_chars`.
fn split_long(text: &str, start: usize, end: usize, max_chars: usize) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let limit = char_limit(text, cursor, end, max_chars);
        if limit >= end {
            pieces.push((cursor, end));
            break;
        }
        let window = &text[cursor..limit];
        let fits_exactly = text[limit..].starts_with(char::is_whitespace);
        let cut = match window.rfind(char::is_whitespace) {
            _ if fits_exactly => limit,
            Some(ws) if ws > 0 => cursor + ws,
            _ => limit,
        };
        let piece = text[cursor..cut].trim_end();
        if !piece.is_empty() {
            pieces.push((cursor, cursor + piece.len()));
        }
        cursor = cut;
        while cursor < end {
            match text[cursor..].chars().next() {
                Some(ch) if ch.is_whitespace() => cursor += ch.len_utf8(),
                _ => break,
            }
        }
    }
    pieces
}

pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<Chunk> {
    let max_chars = chunk_size.max(1);
    let mut pieces: Vec<(usize, usize)> = Vec::new();
    for (start, end) in paragraph_spans(text) {
        if text[start..end].chars().count() > max_chars {
            pieces.extend(split_long(text, start, end, max_chars));
        } else {
            pieces.push((start, end));
        }
    }

    let mut chunks = Vec::new();
    let mut current: Option<(usize, String)> = None;
    for (start, end) in pieces {
        let piece = &text[start..end];
        current = match current.take() {
            Some((chunk_start, mut buffer)) => {
                let merged = buffer.chars().count() + 2 + piece.chars().count();
                if merged <= max_chars {
                    buffer.push_str("\n\n");
                    buffer.push_str(piece);
                    Some((chunk_start, buffer))
                } else {
                    chunks.push(Chunk {
                        index: chunks.len(),
                        start: chunk_start,
                        text: buffer,
                    });
                    Some((start, piece.to_string()))
                }
            }
            None => Some((start, piece.to_string())),
        };
    }
    if let Some((start, buffer)) = current {
        chunks.push(Chunk {
            index: chunks.len(),
            start,
            text: buffer,
        });
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_paragraphs_pack_into_one_chunk() {
        let text = "# Title\n\nFirst paragraph.\n\n\nSecond one.";
        let chunks = chunk_text(text, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].text, "# Title\n\nFirst paragraph.\n\nSecond one.");
    }

    #[test]
    fn test_paragraphs_split_when_limit_exceeded() {
        let text = "aaaa aaaa\n\nbbbb bbbb\n\ncccc";
        let chunks = chunk_text(text, 12);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["aaaa aaaa", "bbbb bbbb", "cccc"]);
        assert_eq!(chunks[1].start, 11);
        assert_eq!(&text[chunks[2].start..], "cccc");
    }

    #[test]
    fn test_long_paragraph_cut_at_whitespace() {
        let text = "one two three four five six";
        let chunks = chunk_text(text, 10);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["one two", "three four", "five six"]);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 10);
            assert!(text[chunk.start..].starts_with(&chunk.text));
        }
    }

    #[test]
    fn test_unbroken_text_cut_at_char_boundary() {
        let text = "ééééééééé";
        let chunks = chunk_text(text, 4);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["éééé", "éééé", "é"]);
        assert_eq!(chunks[1].start, 8);
    }

    #[test]
    fn test_blank_text_has_no_chunks() {
        assert!(chunk_text("", 100).is_empty());
        assert!(chunk_text("  \n\n \t\n", 100).is_empty());
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let text = "Lorem ipsum dolor sit amet.\n\nConsectetur adipiscing elit, sed do eiusmod.\n\nTempor.";
        assert_eq!(chunk_text(text, 30), chunk_text(text, 30));
    }
}
