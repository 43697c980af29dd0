
use std::collections::VecDeque;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{RagError, Result};

/// Separators tried from coarsest to finest before cutting at character boundaries.
/// Paragraphs, then lines, then sentences, then words.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", " "];

/// A source document handed to the pipeline by whatever extracted its text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Filename, URL, or any caller-chosen identifier
    pub id: String,
    /// Full text content
    pub text: String,
}

impl Document {
    #[inline]
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }

    /// Build a document from raw bytes. Invalid UTF-8 sequences are replaced.
    #[inline]
    pub fn from_bytes(id: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            id: id.into(),
            text: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// A contiguous slice of a document, sized for embedding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Identifier of the document this chunk was cut from
    pub document_id: String,
    /// Position of this chunk within its document
    pub chunk_index: usize,
    /// Byte offset of `text` within the document text
    pub offset: usize,
    /// The chunk text, an exact substring of the document
    pub text: String,
    /// Estimated token count
    pub token_count: usize,
}

impl Chunk {
    /// Byte offset one past the end of this chunk within its document
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.text.len()
    }
}

/// Configuration for document chunking. Sizes are measured in characters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum chunk length
    pub chunk_size: usize,
    /// Maximum length of text repeated from the end of the previous chunk
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
        }
    }
}

/// An indivisible span of the source text produced by the recursive split
#[derive(Debug, Clone, Copy)]
struct Piece {
    start: usize,
    end: usize,
    chars: usize,
}

/// Split a document into overlapping chunks no longer than `chunk_size` characters.
///
/// Empty documents produce no chunks. The output is deterministic, and
/// [`reconstruct`] recovers the original text from it.
#[inline]
pub fn chunk_document(document: &Document, config: &ChunkingConfig) -> Result<Vec<Chunk>> {
    if config.chunk_size == 0 || config.overlap >= config.chunk_size {
        return Err(RagError::Config(format!(
            "chunk overlap ({}) must be smaller than chunk size ({})",
            config.overlap, config.chunk_size
        )));
    }

    let text = document.text.as_str();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let mut pieces = Vec::new();
    split_recursive(text, 0, config.chunk_size, SEPARATORS, &mut pieces);

    let chunks: Vec<Chunk> = merge_pieces(&pieces, config)
        .into_iter()
        .enumerate()
        .filter_map(|(chunk_index, span)| {
            let offset = span.start;
            text.get(span).map(|slice| Chunk {
                document_id: document.id.clone(),
                chunk_index,
                offset,
                text: slice.to_string(),
                token_count: estimate_token_count(slice),
            })
        })
        .collect();

    debug!(
        "Chunked document '{}' into {} chunks (avg {} tokens)",
        document.id,
        chunks.len(),
        chunks.iter().map(|c| c.token_count).sum::<usize>() / chunks.len().max(1)
    );

    Ok(chunks)
}

/// Break `segment` into pieces of at most `chunk_size` characters, using the
/// coarsest separator that makes progress. Separators stay attached to the
/// piece they terminate, so pieces tile the segment exactly.
fn split_recursive(
    segment: &str,
    base: usize,
    chunk_size: usize,
    separators: &[&str],
    pieces: &mut Vec<Piece>,
) {
    let chars = segment.chars().count();
    if chars <= chunk_size {
        if !segment.is_empty() {
            pieces.push(Piece {
                start: base,
                end: base + segment.len(),
                chars,
            });
        }
        return;
    }

    let Some((separator, finer)) = separators.split_first() else {
        split_by_chars(segment, base, chunk_size, pieces);
        return;
    };

    let mut start = 0;
    for part in segment.split_inclusive(separator) {
        split_recursive(part, base + start, chunk_size, finer, pieces);
        start += part.len();
    }
}

/// Last resort: cut at character boundaries every `chunk_size` characters
fn split_by_chars(segment: &str, base: usize, chunk_size: usize, pieces: &mut Vec<Piece>) {
    let mut start = 0;
    let mut chars = 0;

    for (idx, _) in segment.char_indices() {
        if chars == chunk_size {
            pieces.push(Piece {
                start: base + start,
                end: base + idx,
                chars,
            });
            start = idx;
            chars = 0;
        }
        chars += 1;
    }

    if chars > 0 {
        pieces.push(Piece {
            start: base + start,
            end: base + segment.len(),
            chars,
        });
    }
}

/// Greedily merge consecutive pieces into chunk spans. After each emitted chunk,
/// the trailing pieces that fit within `overlap` seed the next one.
fn merge_pieces(pieces: &[Piece], config: &ChunkingConfig) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut window: VecDeque<Piece> = VecDeque::new();
    let mut window_chars = 0;

    for piece in pieces {
        if window_chars + piece.chars > config.chunk_size {
            if let Some(span) = window_span(&window) {
                spans.push(span);
            }

            while window_chars > config.overlap
                || (window_chars > 0 && window_chars + piece.chars > config.chunk_size)
            {
                let Some(dropped) = window.pop_front() else {
                    break;
                };
                window_chars -= dropped.chars;
            }
        }

        window.push_back(*piece);
        window_chars += piece.chars;
    }

    if let Some(span) = window_span(&window) {
        spans.push(span);
    }

    spans
}

fn window_span(window: &VecDeque<Piece>) -> Option<Range<usize>> {
    Some(window.front()?.start..window.back()?.end)
}

/// Rebuild the source text from a document's chunks, dropping the overlapping prefixes
#[inline]
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut text = String::new();
    let mut end = 0_usize;

    for chunk in chunks {
        let skip = end.saturating_sub(chunk.offset);
        if let Some(tail) = chunk.text.get(skip..) {
            text.push_str(tail);
        }
        end = end.max(chunk.end());
    }

    text
}

/// Estimate token count using a simple heuristic
/// This is a rough approximation - actual tokenization would be more accurate
#[inline]
pub fn estimate_token_count(text: &str) -> usize {
    // Rough heuristic: 1 token ≈ 0.75 words for English text
    // Add extra tokens for punctuation and special characters
    let word_count = text.split_whitespace().count();
    let punct_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();

    (punct_count as f64).mul_add(0.1, word_count as f64 / 0.75) as usize
}
