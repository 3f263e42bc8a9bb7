//! Text cleanup and chunking.
//!
//! [`clean`] strips extraction noise (page markers, repeated headers/footers,
//! exotic whitespace) without altering semantic word content. [`chunk`] splits
//! the cleaned text into an ordered sequence of [`TextChunk`]s whose overlap
//! is realized as a literal prefix copied from the previous chunk's tail.
//!
//! All sizes are measured in characters, not bytes — uploaded documents are
//! frequently CJK and byte slicing would land mid-codepoint.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::error::PipelineError;
use crate::models::TextChunk;

/// Chunking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMethod {
    /// Prefer paragraph boundaries, then lines, then sentences, then hard
    /// cuts, greedily filling up to the chunk size.
    Recursive,
    Paragraph,
    Sentence,
    /// Hard cuts every `chunk_size - overlap` characters.
    Fixed,
}

/// Size parameters for [`chunk`].
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    pub chunk_size: usize,
    pub overlap: usize,
    pub min_chunk_size: usize,
}

static SPECIAL_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\u{00A0}\u{2002}-\u{200B}\u{FEFF}]").unwrap());
static CONTROL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").unwrap());
static MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").unwrap());
static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n(\s*\n){2,}").unwrap());

/// Lines that are page furniture rather than content.
static PAGE_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^第\s*\d+\s*页$",
        r"(?i)^page\s*\d+$",
        r"^\d+\s*/\s*\d+$",
        r"^-\s*\d+\s*-$",
        r"^\d+$",
        r"^_{10,}$",
        r"^-{10,}$",
        r"^={10,}$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// A short line must repeat this many times to be treated as a header/footer.
const REPEAT_THRESHOLD: usize = 3;
/// Only lines up to this many characters are header/footer candidates.
const REPEAT_MAX_CHARS: usize = 60;

/// Removes boilerplate from extracted text.
pub fn clean(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = SPECIAL_SPACE.replace_all(&text, " ");
    let text = CONTROL_CHARS.replace_all(&text, "");
    let text = MULTI_SPACE.replace_all(&text, " ");

    // Count short lines so recurring headers/footers can be dropped.
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() && trimmed.chars().count() <= REPEAT_MAX_CHARS {
            *counts.entry(trimmed).or_insert(0) += 1;
        }
    }

    let kept: Vec<&str> = text
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return true;
            }
            if PAGE_MARKERS.iter().any(|re| re.is_match(trimmed)) {
                return false;
            }
            if trimmed.chars().count() <= REPEAT_MAX_CHARS
                && counts.get(trimmed).copied().unwrap_or(0) >= REPEAT_THRESHOLD
            {
                return false;
            }
            true
        })
        .collect();

    let joined = kept.join("\n");
    BLANK_RUNS.replace_all(&joined, "\n\n").trim().to_string()
}

/// Splits text into overlapping chunks with contiguous indices from 0.
pub fn chunk(
    text: &str,
    opts: &ChunkOptions,
    method: ChunkMethod,
) -> Result<Vec<TextChunk>, PipelineError> {
    if opts.chunk_size == 0 {
        return Err(PipelineError::InvalidRequest(
            "chunk_size must be > 0".to_string(),
        ));
    }
    if opts.overlap >= opts.chunk_size {
        return Err(PipelineError::InvalidRequest(
            "overlap must be smaller than chunk_size".to_string(),
        ));
    }
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chunks = match method {
        ChunkMethod::Fixed => fixed_chunks(text, opts),
        ChunkMethod::Paragraph => {
            boundary_chunks(paragraph_units(text, opts.chunk_size), "\n\n", opts, false)
        }
        ChunkMethod::Sentence => {
            boundary_chunks(sentence_units(text, opts.chunk_size), " ", opts, false)
        }
        ChunkMethod::Recursive => {
            boundary_chunks(recursive_units(text, opts.chunk_size), "", opts, true)
        }
    };
    Ok(chunks)
}

// ---- fixed ----

fn fixed_chunks(text: &str, opts: &ChunkOptions) -> Vec<TextChunk> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let stride = opts.chunk_size - opts.overlap;

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;
    while start < n {
        ranges.push((start, (start + opts.chunk_size).min(n)));
        if start + opts.chunk_size >= n {
            break;
        }
        start += stride;
    }

    // A trailing remainder shorter than the minimum merges into the previous
    // chunk instead of being emitted on its own.
    if ranges.len() >= 2 {
        let (last_start, last_end) = *ranges.last().unwrap();
        if last_end - last_start < opts.min_chunk_size {
            ranges.pop();
            ranges.last_mut().unwrap().1 = n;
        }
    }

    ranges
        .iter()
        .enumerate()
        .map(|(i, &(s, e))| TextChunk {
            index: i,
            text: chars[s..e].iter().collect(),
            overlap_prefix_len: if i == 0 {
                0
            } else {
                ranges[i - 1].1.saturating_sub(s)
            },
        })
        .collect()
}

// ---- boundary methods ----

fn char_count(s: &str) -> usize {
    s.chars().count()
}

fn tail_chars(s: &str, n: usize) -> String {
    let total = char_count(s);
    if total <= n {
        return s.to_string();
    }
    s.chars().skip(total - n).collect()
}

/// Hard character cuts for a unit that no boundary can shorten.
fn hard_units(text: &str, chunk_size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size)
        .map(|c| c.iter().collect())
        .collect()
}

const SENTENCE_ENDS: &[char] = &['。', '．', '.', '!', '?', '！', '？', ';', '；'];

/// Splits into sentences, keeping terminal punctuation with each sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for ch in text.chars() {
        cur.push(ch);
        if SENTENCE_ENDS.contains(&ch) {
            let s = std::mem::take(&mut cur);
            if !s.trim().is_empty() {
                out.push(s.trim().to_string());
            }
        }
    }
    if !cur.trim().is_empty() {
        out.push(cur.trim().to_string());
    }
    out
}

fn sentence_units(text: &str, chunk_size: usize) -> Vec<String> {
    let mut units = Vec::new();
    for sentence in split_sentences(text) {
        if char_count(&sentence) > chunk_size {
            units.extend(hard_units(&sentence, chunk_size));
        } else {
            units.push(sentence);
        }
    }
    units
}

fn paragraph_units(text: &str, chunk_size: usize) -> Vec<String> {
    let mut units = Vec::new();
    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        if char_count(para) > chunk_size {
            units.extend(sentence_units(para, chunk_size));
        } else {
            units.push(para.to_string());
        }
    }
    units
}

/// Paragraphs, then lines, then sentences, then hard cuts. Units keep their
/// trailing separator so greedy packing preserves the original layout.
fn recursive_units(text: &str, chunk_size: usize) -> Vec<String> {
    let mut units = Vec::new();
    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    for (pi, para) in paragraphs.iter().enumerate() {
        if para.trim().is_empty() {
            continue;
        }
        let sep = if pi + 1 < paragraphs.len() { "\n\n" } else { "" };
        if char_count(para) <= chunk_size {
            units.push(format!("{}{}", para.trim_end(), sep));
            continue;
        }
        let lines: Vec<&str> = para.split('\n').collect();
        for (li, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let line_sep = if li + 1 < lines.len() { "\n" } else { sep };
            if char_count(line) <= chunk_size {
                units.push(format!("{}{}", line, line_sep));
            } else {
                for sentence in sentence_units(line, chunk_size) {
                    units.push(format!("{} ", sentence));
                }
            }
        }
    }
    units
}

/// Greedily packs units into parts no larger than `chunk_size`, merges a
/// too-short trailing part into its predecessor, then applies overlap
/// prefixes.
fn boundary_chunks(
    units: Vec<String>,
    joiner: &str,
    opts: &ChunkOptions,
    boundary_aware_overlap: bool,
) -> Vec<TextChunk> {
    let joiner_len = char_count(joiner);
    let mut parts: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut buf_len = 0usize;

    for unit in &units {
        let unit_len = char_count(unit);
        if !buf.is_empty() && buf_len + joiner_len + unit_len > opts.chunk_size {
            parts.push(std::mem::take(&mut buf));
            buf_len = 0;
        }
        if buf.is_empty() {
            buf.push_str(unit);
            buf_len = unit_len;
        } else {
            buf.push_str(joiner);
            buf.push_str(unit);
            buf_len += joiner_len + unit_len;
        }
    }
    if !buf.is_empty() {
        parts.push(buf);
    }

    let mut parts: Vec<String> = parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    if parts.len() >= 2 {
        let last_len = char_count(parts.last().unwrap());
        if last_len < opts.min_chunk_size {
            let last = parts.pop().unwrap();
            let prev = parts.last_mut().unwrap();
            if joiner.is_empty() {
                prev.push(' ');
            } else {
                prev.push_str(joiner);
            }
            prev.push_str(&last);
        }
    }

    let mut chunks: Vec<TextChunk> = Vec::with_capacity(parts.len());
    let mut prev_text: Option<String> = None;
    for (i, part) in parts.into_iter().enumerate() {
        let (text, opl) = match &prev_text {
            Some(prev) if opts.overlap > 0 => {
                let prefix = overlap_prefix(prev, opts.overlap, boundary_aware_overlap);
                let opl = char_count(&prefix);
                (format!("{}{}", prefix, part), opl)
            }
            _ => (part, 0),
        };
        prev_text = Some(text.clone());
        chunks.push(TextChunk {
            index: i,
            text,
            overlap_prefix_len: opl,
        });
    }
    chunks
}

const OVERLAP_BOUNDARIES: &[char] = &[
    '。', '！', '？', '；', '：', '，', '、', '.', '!', '?', ';', ',', '\n',
];

/// Tail of the previous chunk used as the next chunk's prefix. When boundary
/// aware, the prefix starts just after the first boundary character inside
/// the tail window.
fn overlap_prefix(prev: &str, overlap: usize, boundary_aware: bool) -> String {
    let tail = tail_chars(prev, overlap);
    if !boundary_aware {
        return tail;
    }
    let chars: Vec<char> = tail.chars().collect();
    for (i, ch) in chars.iter().enumerate() {
        if OVERLAP_BOUNDARIES.contains(ch) {
            let rest: String = chars[i + 1..].iter().collect();
            let rest = rest.trim_start().to_string();
            if !rest.is_empty() {
                return rest;
            }
            return tail;
        }
    }
    tail
}
