//! Splits long documents into token-bounded, overlapping chunks.

use serde::Serialize;

/// A bounded, ordered slice of a source document.
///
/// Chunks are produced once per document and never mutated; `index` equals
/// the chunk's position in the originating document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// Zero-based position in document order
    pub index: usize,
    /// The chunk text, lines joined with `\n`
    pub text: String,
}

/// Cheap token estimate: whitespace-delimited word count.
///
/// Good enough to keep chunks inside a model's context budget without
/// pulling in a tokenizer.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Splits `text` into chunks of at most `max_tokens` estimated tokens.
///
/// Lines are the unit of accumulation: the input is split into non-empty
/// newline-delimited lines, and lines are appended to the current chunk
/// while the running token estimate stays within budget. When the next line
/// would exceed the budget, the chunk is closed and the next one is seeded
/// with the last `overlap_lines` lines of the closed chunk, preserving
/// context across chunk boundaries. `overlap_lines = 0` disables overlap.
///
/// The budget is advisory: a single line whose own estimate exceeds
/// `max_tokens` still becomes (part of) a chunk, and a chunk never closes
/// before it has absorbed at least one non-overlap line, so every chunk
/// after the first contributes fresh content.
///
/// Empty or all-blank input yields no chunks. Output is deterministic.
///
/// # Examples
///
/// ```
/// use kizami::chunker::chunk;
///
/// let doc = "alpha beta\ngamma delta\nepsilon zeta";
/// let chunks = chunk(doc, 4, 1);
///
/// assert_eq!(chunks.len(), 2);
/// assert_eq!(chunks[0].text, "alpha beta\ngamma delta");
/// // Second chunk starts with the overlapped line.
/// assert_eq!(chunks[1].text, "gamma delta\nepsilon zeta");
/// ```
pub fn chunk(text: &str, max_tokens: usize, overlap_lines: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_tokens = 0usize;
    // Lines carried over from the previous chunk; never counted as fresh
    // content when deciding whether the chunk may close.
    let mut seed_len = 0usize;

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let line_tokens = estimate_tokens(line);

        if current.len() > seed_len && current_tokens + line_tokens > max_tokens {
            let closed: Vec<&str> = current.clone();
            chunks.push(Chunk {
                index: chunks.len(),
                text: closed.join("\n"),
            });

            let overlap_start = closed.len().saturating_sub(overlap_lines);
            current = closed[overlap_start..].to_vec();
            seed_len = current.len();
            current_tokens = current.iter().map(|l| estimate_tokens(l)).sum();
        }

        current.push(line);
        current_tokens += line_tokens;
    }

    if current.len() > seed_len {
        chunks.push(Chunk {
            index: chunks.len(),
            text: current.join("\n"),
        });
    }

    chunks
}
