//! Recursive character splitter for decoded document text.
//!
//! Text documents are divided on paragraph boundaries first, then line and
//! word boundaries, and only hard-split when a single run of characters
//! exceeds the budget. Adjacent chunks share a configurable character overlap
//! so spans around boundaries remain visible to retrieval and prompts.
//! Tabular documents bypass this module entirely; each serialized row is its
//! own chunk.

/// Separator cascade tried in order before hard-splitting.
const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

/// Split text into chunks of at most `chunk_size` characters with `overlap`
/// characters carried between adjacent chunks.
///
/// Whitespace-only input yields no chunks. Every produced chunk is non-empty
/// and respects the size budget.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    if chunk_size == 0 || text.trim().is_empty() {
        return Vec::new();
    }
    let parts = split_recursive(text, chunk_size, &SEPARATORS);
    merge_with_overlap(parts, chunk_size, overlap.min(chunk_size.saturating_sub(1)))
}

fn split_recursive(text: &str, chunk_size: usize, separators: &[&str]) -> Vec<String> {
    if text.len() <= chunk_size {
        let trimmed = text.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        };
    }

    match separators.split_first() {
        Some((separator, rest)) => {
            if text.contains(separator) {
                text.split(separator)
                    .flat_map(|part| split_recursive(part, chunk_size, rest))
                    .collect()
            } else {
                split_recursive_next(text, chunk_size, rest)
            }
        }
        None => hard_split(text, chunk_size),
    }
}

fn split_recursive_next(text: &str, chunk_size: usize, rest: &[&str]) -> Vec<String> {
    if rest.is_empty() {
        hard_split(text, chunk_size)
    } else {
        split_recursive(text, chunk_size, rest)
    }
}

/// Split a separator-free run at character boundaries.
fn hard_split(text: &str, chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > chunk_size && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

fn merge_with_overlap(parts: Vec<String>, chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buffer = String::new();

    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let projected = if buffer.is_empty() {
            part.len()
        } else {
            buffer.len() + 1 + part.len()
        };

        if projected > chunk_size && !buffer.is_empty() {
            let tail = overlap_tail(&buffer, overlap, chunk_size, part.len());
            chunks.push(std::mem::take(&mut buffer));
            buffer.push_str(&tail);
        }

        if !buffer.is_empty() {
            buffer.push('\n');
        }
        buffer.push_str(part);
    }

    if !buffer.is_empty() {
        chunks.push(buffer);
    }
    chunks
}

/// Tail of the previous chunk carried into the next one, trimmed so the
/// combined chunk still fits the budget and starts on a word boundary.
fn overlap_tail(chunk: &str, overlap: usize, chunk_size: usize, next_len: usize) -> String {
    let budget = overlap.min(chunk_size.saturating_sub(next_len + 1));
    if budget == 0 {
        return String::new();
    }

    let mut start = chunk.len().saturating_sub(budget);
    while start < chunk.len() && !chunk.is_char_boundary(start) {
        start += 1;
    }
    let tail = &chunk[start..];
    if start == 0 {
        return tail.to_string();
    }
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start().to_string(),
        None => tail.to_string(),
    }
}
