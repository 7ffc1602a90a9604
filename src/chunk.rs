//! Overlapping character-window chunker.
//!
//! Splits a [`RetrievableUnit`]'s text into [`Chunk`]s of at most
//! `chunk_size` characters. Consecutive chunks of the same unit share
//! exactly `chunk_overlap` characters, so the original text is recovered
//! as `chunks[0] + chunks[1][overlap..] + chunks[2][overlap..] + ...`.
//!
//! Each cut prefers the last paragraph break inside the window, then the
//! last line break, then the last space, and only falls back to a hard cut
//! when the window has none of them. Lengths are counted in `char`s.

use std::collections::HashSet;

use crate::models::{Chunk, RetrievableUnit};

/// Preferred cut points, coarsest first.
const SEPARATORS: &[&str] = &["\n\n", "\n", " "];

/// Split text into overlapping windows.
///
/// Always returns at least one piece; text that already fits comes back
/// unchanged. `chunk_overlap` is clamped below `chunk_size`.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let overlap = chunk_overlap.min(chunk_size - 1);
    let chars: Vec<char> = text.chars().collect();

    if chars.len() <= chunk_size {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    loop {
        if chars.len() - start <= chunk_size {
            pieces.push(chars[start..].iter().collect());
            break;
        }

        let hard_end = start + chunk_size;
        // the next window starts at `end - overlap`, which must move forward
        let min_end = start + overlap + 1;
        let end = find_cut(&chars, start, min_end, hard_end).unwrap_or(hard_end);

        pieces.push(chars[start..end].iter().collect());
        start = end - overlap;
    }
    pieces
}

/// Last position in `min_end..=hard_end` that sits just after a separator.
fn find_cut(chars: &[char], start: usize, min_end: usize, hard_end: usize) -> Option<usize> {
    for sep in SEPARATORS {
        let sep: Vec<char> = sep.chars().collect();
        let found = (min_end..=hard_end)
            .rev()
            .filter(|&end| end >= start + sep.len())
            .find(|&end| chars[end - sep.len()..end] == sep[..]);
        if found.is_some() {
            return found;
        }
    }
    None
}

/// Chunk one unit. Every chunk carries the unit's metadata.
pub fn chunk_unit(unit: &RetrievableUnit, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    let pieces = split_text(&unit.text, chunk_size, chunk_overlap);
    let total_chunks = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(chunk_index, text)| Chunk {
            text,
            metadata: unit.metadata.clone(),
            chunk_index,
            total_chunks,
        })
        .collect()
}

/// Chunk every unit independently, preserving unit order.
pub fn chunk_units(units: &[RetrievableUnit], chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    let chunks: Vec<Chunk> = units
        .iter()
        .flat_map(|unit| chunk_unit(unit, chunk_size, chunk_overlap))
        .collect();
    tracing::info!(
        units = units.len(),
        chunks = chunks.len(),
        chunk_size,
        chunk_overlap,
        "split units into chunks"
    );
    chunks
}

/// Summary of a chunk set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkStats {
    pub total_chunks: usize,
    pub avg_length: f64,
    pub min_length: usize,
    pub max_length: usize,
    pub unique_authors: usize,
    pub unique_channels: usize,
}

impl ChunkStats {
    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        if chunks.is_empty() {
            return Self::default();
        }

        let lengths: Vec<usize> = chunks.iter().map(|c| c.text.chars().count()).collect();
        let authors: HashSet<&str> = chunks.iter().map(|c| c.metadata.author.as_str()).collect();
        let channels: HashSet<&str> = chunks
            .iter()
            .map(|c| c.metadata.channel_name.as_str())
            .collect();

        Self {
            total_chunks: chunks.len(),
            avg_length: lengths.iter().sum::<usize>() as f64 / lengths.len() as f64,
            min_length: lengths.iter().copied().min().unwrap_or(0),
            max_length: lengths.iter().copied().max().unwrap_or(0),
            unique_authors: authors.len(),
            unique_channels: channels.len(),
        }
    }
}
