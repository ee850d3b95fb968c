//! Ranking and presentation of raw index hits.
//!
//! Turns [`RawHit`] distances into normalized scores and similarity
//! percentages, orders them deterministically, and builds a preview of
//! each body. The ranker never touches the index.
//!
//! # Similarity
//!
//! | Metric | `score` | `similarity` (%) |
//! |--------|---------|------------------|
//! | cosine | `1 - d` | `(1 - d) × 100`, clipped to `[0, 100]` |
//! | dot | `-d` | `-d × 100`, clipped to `[0, 100]` |
//! | euclidean | `1 / (1 + d)` | `100 / (1 + d)` |
//!
//! Results are ordered by score descending, then by insertion sequence,
//! then by id.

use std::cmp::Ordering;

use crate::models::{DistanceMetric, QueryResult, RawHit};

pub const DEFAULT_PREVIEW_CHARS: usize = 200;
const ELLIPSIS: &str = "...";

/// Strings wrapped around each matched query term in a preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighlightMarkers {
    pub pre: String,
    pub post: String,
}

impl HighlightMarkers {
    pub fn new(pre: impl Into<String>, post: impl Into<String>) -> Self {
        Self {
            pre: pre.into(),
            post: post.into(),
        }
    }

    /// Bold yellow on an ANSI terminal.
    pub fn ansi() -> Self {
        Self::new("\u{1b}[1;33m", "\u{1b}[0m")
    }
}

#[derive(Debug, Clone)]
pub struct RankOptions {
    /// Maximum body characters in a preview.
    pub preview_chars: usize,
    /// When set, previews are centered on the first query-term match.
    pub highlight: Option<HighlightMarkers>,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            preview_chars: DEFAULT_PREVIEW_CHARS,
            highlight: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ranker {
    metric: DistanceMetric,
    options: RankOptions,
}

impl Ranker {
    pub fn new(metric: DistanceMetric, options: RankOptions) -> Self {
        Self { metric, options }
    }

    pub fn rank(&self, hits: Vec<RawHit>, query_text: &str) -> Vec<QueryResult> {
        let mut scored: Vec<(f64, f64, RawHit)> = hits
            .into_iter()
            .map(|hit| {
                let (score, similarity) = similarity(self.metric, hit.distance);
                (score, similarity, hit)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(a.2.seq.cmp(&b.2.seq))
                .then_with(|| a.2.id.cmp(&b.2.id))
        });

        let terms = query_terms(query_text);
        scored
            .into_iter()
            .enumerate()
            .map(|(i, (score, similarity, hit))| QueryResult {
                rank: i + 1,
                preview: self.preview(&hit.payload.body, &terms),
                id: hit.id,
                score,
                similarity,
                payload: hit.payload,
            })
            .collect()
    }

    fn preview(&self, body: &str, terms: &[Vec<char>]) -> String {
        match &self.options.highlight {
            Some(markers) if !terms.is_empty() => {
                highlight_excerpt(body, terms, self.options.preview_chars, markers)
                    .unwrap_or_else(|| truncate_preview(body, self.options.preview_chars))
            }
            _ => truncate_preview(body, self.options.preview_chars),
        }
    }
}

/// `(score, similarity percentage)` for a distance under `metric`.
pub fn similarity(metric: DistanceMetric, distance: f32) -> (f64, f64) {
    let d = distance as f64;
    match metric {
        DistanceMetric::Cosine => {
            let score = 1.0 - d;
            (score, (score * 100.0).clamp(0.0, 100.0))
        }
        DistanceMetric::Dot => {
            let score = -d;
            (score, (score * 100.0).clamp(0.0, 100.0))
        }
        DistanceMetric::Euclidean => {
            let score = 1.0 / (1.0 + d.max(0.0));
            (score, score * 100.0)
        }
    }
}

/// Body cut to `max_chars` characters, with `...` appended when cut.
pub fn truncate_preview(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{}", &body[..idx], ELLIPSIS),
        None => body.to_string(),
    }
}

fn query_terms(query: &str) -> Vec<Vec<char>> {
    let mut terms: Vec<Vec<char>> = query
        .split_whitespace()
        .map(|t| t.chars().flat_map(char::to_lowercase).collect::<Vec<char>>())
        .filter(|t| !t.is_empty())
        .collect();
    // longest first so "apple pie" prefers "apple" over "app"
    terms.sort_by(|a, b| b.len().cmp(&a.len()));
    terms.dedup();
    terms
}

fn matches_at(body: &[char], at: usize, term: &[char]) -> bool {
    if at + term.len() > body.len() {
        return false;
    }
    body[at..at + term.len()]
        .iter()
        .zip(term)
        .all(|(b, t)| b.to_lowercase().eq(std::iter::once(*t)))
}

/// Non-overlapping `(start, len)` matches of any term, left to right.
fn find_matches(body: &[char], terms: &[Vec<char>]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < body.len() {
        match terms.iter().find(|t| matches_at(body, i, t)) {
            Some(term) => {
                out.push((i, term.len()));
                i += term.len();
            }
            None => i += 1,
        }
    }
    out
}

/// Excerpt of at most `max_chars` body characters around the first match,
/// with every fully-contained match wrapped in `markers`.
fn highlight_excerpt(
    body: &str,
    terms: &[Vec<char>],
    max_chars: usize,
    markers: &HighlightMarkers,
) -> Option<String> {
    let chars: Vec<char> = body.chars().collect();
    let matches = find_matches(&chars, terms);
    let (first, _) = *matches.first()?;

    let lead = max_chars / 4;
    let mut start = first.saturating_sub(lead);
    let end = (start + max_chars).min(chars.len());
    if end - start < max_chars {
        start = end.saturating_sub(max_chars);
    }

    let mut out = String::new();
    if start > 0 {
        out.push_str(ELLIPSIS);
    }
    let mut pos = start;
    for &(m_start, m_len) in &matches {
        if m_start < pos || m_start + m_len > end {
            continue;
        }
        out.extend(&chars[pos..m_start]);
        out.push_str(&markers.pre);
        out.extend(&chars[m_start..m_start + m_len]);
        out.push_str(&markers.post);
        pos = m_start + m_len;
    }
    out.extend(&chars[pos..end]);
    if end < chars.len() {
        out.push_str(ELLIPSIS);
    }
    Some(out)
}
