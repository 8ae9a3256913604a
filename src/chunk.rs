//! Paragraph chunker for embedding input.
//!
//! Paragraphs (separated by blank lines) are packed greedily into chunks of
//! at most `max_tokens`, estimated at four characters per token. A paragraph
//! longer than one chunk is cut at the last newline or space before the
//! limit, never inside a UTF-8 character. Indices start at 0 and are
//! contiguous, and the same input always yields the same chunks. Blank text
//! yields no chunks.

use crate::models::Chunk;

const CHARS_PER_TOKEN: usize = 4;

pub fn chunk_text(document_id: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let limit = (max_tokens * CHARS_PER_TOKEN).max(1);

    let mut pieces = Vec::new();
    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if paragraph.len() <= limit {
            pieces.push(paragraph);
        } else {
            split_long(paragraph, limit, &mut pieces);
        }
    }

    let mut texts: Vec<String> = Vec::new();
    let mut buf = String::new();
    for piece in pieces {
        if !buf.is_empty() && buf.len() + 2 + piece.len() > limit {
            texts.push(std::mem::take(&mut buf));
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(piece);
    }
    if !buf.is_empty() {
        texts.push(buf);
    }

    texts
        .into_iter()
        .enumerate()
        .map(|(i, text)| Chunk {
            document_id: document_id.to_string(),
            chunk_index: i as i64,
            text,
        })
        .collect()
}

fn split_long<'a>(mut rest: &'a str, limit: usize, out: &mut Vec<&'a str>) {
    while rest.len() > limit {
        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let head = &rest[..cut];
        let at = head
            .rfind('\n')
            .or_else(|| head.rfind(' '))
            .filter(|&pos| pos > 0)
            .map(|pos| pos + 1)
            .unwrap_or(cut.max(first_char_len(rest)));
        let piece = rest[..at].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        rest = &rest[at..];
    }
    let tail = rest.trim();
    if !tail.is_empty() {
        out.push(tail);
    }
}

fn first_char_len(s: &str) -> usize {
    s.chars().next().map(char::len_utf8).unwrap_or(1)
}
