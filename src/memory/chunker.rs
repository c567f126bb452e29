//! Sentence-aligned text chunking.
//!
//! Long content is split into chunks that respect sentence boundaries so
//! retrieval never cuts mid-thought. Adjacent chunks share tail sentences up
//! to the overlap budget for continuity.

// ─── ChunkerConfig ───────────────────────────────────────────────────────────

/// Configuration for the sentence chunker. Token counts use the runtime's
/// uniform ceil(chars / 4) estimate.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Preferred chunk size in tokens.
    pub target_tokens: usize,
    /// Tokens of tail-sentence overlap re-seeded into the next chunk.
    pub overlap_tokens: usize,
    /// Hard ceiling; a single sentence above it is emitted alone.
    pub max_chunk_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: 256,
            overlap_tokens: 32,
            max_chunk_tokens: 512,
        }
    }
}

/// ceil(chars / 4).
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

// ─── Sentence splitting ──────────────────────────────────────────────────────

/// Split `text` into sentences at `.`, `!`, `?` followed by whitespace, and
/// at newlines. Delimiters stay attached to their sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
            }
            current.clear();
            continue;
        }
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().is_none_or(|n| n.is_whitespace()) {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
            }
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }
    sentences
}

// ─── chunk_text ──────────────────────────────────────────────────────────────

/// Split `text` into sentence-aligned chunks under `config`.
///
/// Empty input yields no chunks. A sentence longer than `max_chunk_tokens`
/// becomes its own chunk.
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<String> {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0usize;
    // How many leading sentences of `current` are overlap carried from the
    // previous chunk; a chunk is only emitted once it holds fresh material.
    let mut seeded = 0usize;

    for sentence in sentences {
        let tokens = estimate_tokens(&sentence);

        if tokens > config.max_chunk_tokens {
            // Oversized sentence: emit whatever is pending, then the
            // sentence alone with no overlap carry-over.
            if current.len() > seeded {
                chunks.push(current.join(" "));
            }
            current.clear();
            current_tokens = 0;
            seeded = 0;
            chunks.push(sentence);
            continue;
        }

        if current_tokens + tokens > config.target_tokens && current.len() > seeded {
            chunks.push(current.join(" "));
            // Re-seed with the tail sentences that fit the overlap budget.
            let mut tail: Vec<String> = Vec::new();
            let mut tail_tokens = 0usize;
            for prev in current.iter().rev() {
                let prev_tokens = estimate_tokens(prev);
                if tail_tokens + prev_tokens > config.overlap_tokens {
                    break;
                }
                tail_tokens += prev_tokens;
                tail.push(prev.clone());
            }
            tail.reverse();
            seeded = tail.len();
            current_tokens = tail_tokens;
            current = tail;
        }

        current_tokens += tokens;
        current.push(sentence);
    }

    if current.len() > seeded {
        chunks.push(current.join(" "));
    }

    chunks
}

// ─── Tests ───────────────────────────────────────────────────────────────────
