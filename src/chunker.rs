use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ChunkError;
use crate::loader::{DocumentRecord, PaperMetadata};

/// Break points tried in order, coarsest first.
const SEPARATORS: [&[char]; 3] = [&['\n', '\n'], &['\n'], &[' ']];

/// A bounded window of one page's text, carrying the page's metadata unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    /// Character offset of the window within the page text.
    pub start: usize,
    /// Position of the chunk within its page.
    pub index: usize,
    pub page: usize,
    pub metadata: PaperMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    size: usize,
    overlap: usize,
}

impl ChunkConfig {
    pub fn new(size: usize, overlap: usize) -> Result<Self, ChunkError> {
        if size == 0 {
            return Err(ChunkError::ZeroSize);
        }
        if overlap >= size {
            return Err(ChunkError::OverlapTooLarge { size, overlap });
        }
        Ok(ChunkConfig { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            size: 1000,
            overlap: 200,
        }
    }
}

/// Splits every page into overlapping chunks, in page order.
pub fn split_documents(docs: &[DocumentRecord], config: ChunkConfig) -> Vec<Chunk> {
    let chunks: Vec<Chunk> = docs
        .iter()
        .flat_map(|doc| {
            split_text(&doc.text, config)
                .into_iter()
                .enumerate()
                .map(move |(index, (start, text))| Chunk {
                    text,
                    start,
                    index,
                    page: doc.page,
                    metadata: doc.metadata.clone(),
                })
        })
        .collect();
    info!("Split into {} chunks", chunks.len());
    chunks
}

/// Splits `text` into `(char_offset, window)` pairs.
///
/// Windows never exceed `config.size()` characters. Each window ends after the
/// coarsest separator that still leaves room for the overlap, or is hard-cut when
/// none fits. The next window starts at most `config.overlap()` characters
/// before the previous end, snapped forward to the start of a word.
pub fn split_text(text: &str, config: ChunkConfig) -> Vec<(usize, String)> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut windows = Vec::new();
    let mut start = 0;

    while start < len {
        let hard_end = (start + config.size).min(len);
        let end = if hard_end == len {
            len
        } else {
            break_point(&chars, start + config.overlap + 1, hard_end)
        };
        windows.push((start, chars[start..end].iter().collect()));
        if end == len {
            break;
        }
        start = next_start(&chars, end - config.overlap, end);
    }

    windows
}

fn break_point(chars: &[char], min_end: usize, hard_end: usize) -> usize {
    for sep in SEPARATORS {
        let found = (min_end.max(sep.len())..=hard_end)
            .rev()
            .find(|&end| &chars[end - sep.len()..end] == sep);
        if let Some(end) = found {
            return end;
        }
    }
    hard_end
}

fn next_start(chars: &[char], floor: usize, end: usize) -> usize {
    (floor..=end)
        .find(|&pos| pos > 0 && chars[pos - 1].is_whitespace())
        .unwrap_or(floor)
}
