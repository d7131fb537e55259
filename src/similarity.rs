//! Graded comparison of question keys.
//!
//! Exact and case/punctuation-insensitive matches are checked first since
//! copy-paste duplicates dominate real question banks. The TF-IDF cosine
//! comparison only runs when the threshold allows scores below 99.

use std::sync::LazyLock;

use ahash::AHashMap;
use regex::Regex;

use crate::record::Record;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w\w+\b").expect("token pattern is valid"));

// ASCII symbols such as `$` or `~` are not in \p{P}, hence the union
static PUNCTUATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{P}[:punct:]]").expect("punctuation pattern is valid"));

/// Which rule produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Byte-for-byte identical.
    Exact,
    /// Identical after dropping punctuation and case.
    Normalized,
    /// Threshold is 99 or above, statistical comparison not attempted.
    Skipped,
    /// TF-IDF cosine similarity.
    Statistical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Score {
    pub value: u8,
    pub kind: MatchKind,
}

/// Stateless comparator carrying the configured threshold.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityEngine {
    threshold: u8,
}

impl SimilarityEngine {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold: threshold.min(100),
        }
    }

    /// Score two keys in `0..=100`, with the rule that produced the score.
    pub fn compare(&self, a: &str, b: &str) -> Score {
        if a == b {
            return Score {
                value: 100,
                kind: MatchKind::Exact,
            };
        }
        if normalize(a) == normalize(b) {
            return Score {
                value: 99,
                kind: MatchKind::Normalized,
            };
        }
        if self.threshold >= 99 {
            return Score {
                value: 0,
                kind: MatchKind::Skipped,
            };
        }
        Score {
            value: tfidf_cosine(a, b),
            kind: MatchKind::Statistical,
        }
    }

    /// Score of `b` against `a` when the two are distinct records whose
    /// comparison keys reach the threshold. `None` otherwise, including
    /// self-comparison.
    pub fn duplicate_score(&self, a: &Record, b: &Record) -> Option<Score> {
        if a.sequence_id == b.sequence_id {
            return None;
        }
        let score = self.compare(&a.comparison_key(), &b.comparison_key());
        (score.value >= self.threshold).then_some(score)
    }
}

/// Lower-case and drop punctuation, Unicode punctuation included.
fn normalize(text: &str) -> String {
    PUNCTUATION_RE.replace_all(text, "").to_lowercase()
}

fn term_counts(text: &str) -> AHashMap<String, usize> {
    let lowered = text.to_lowercase();
    let mut counts = AHashMap::new();
    for m in TOKEN_RE.find_iter(&lowered) {
        *counts.entry(m.as_str().to_string()).or_insert(0) += 1;
    }
    counts
}

/// Cosine similarity of smoothed TF-IDF vectors over the corpus `{a, b}`,
/// scaled to 100 and truncated.
const UNIT_TOLERANCE: f64 = 1e-12;

fn tfidf_cosine(a: &str, b: &str) -> u8 {
    let tf_a = term_counts(a);
    let tf_b = term_counts(b);
    if tf_a.is_empty() || tf_b.is_empty() {
        return 0;
    }

    // Smoothed idf with n = 2: shared terms weigh 1.0, others 1 + ln(3/2)
    let idf = |term: &str| {
        let df = usize::from(tf_a.contains_key(term)) + usize::from(tf_b.contains_key(term));
        (3.0 / (1.0 + df as f64)).ln() + 1.0
    };

    let va = weigh(&tf_a, idf);
    let vb = weigh(&tf_b, idf);
    let dot: f64 = va
        .iter()
        .filter_map(|(term, wa)| {
            vb.binary_search_by(|(t, _)| t.cmp(term))
                .ok()
                .map(|i| wa * vb[i].1)
        })
        .sum();

    to_percent(dot)
}

/// Truncate a cosine to a whole percentage. Only a sum that lands within
/// rounding error of 1.0 is lifted to 100.
fn to_percent(cosine: f64) -> u8 {
    if cosine >= 1.0 - UNIT_TOLERANCE {
        return 100;
    }
    (cosine * 100.0).clamp(0.0, 100.0) as u8
}

/// L2-normalized tf-idf weights, sorted by term so float sums do not depend
/// on hash order.
fn weigh(tf: &AHashMap<String, usize>, idf: impl Fn(&str) -> f64) -> Vec<(&str, f64)> {
    let mut weights: Vec<(&str, f64)> = tf
        .iter()
        .map(|(term, count)| (term.as_str(), *count as f64 * idf(term)))
        .collect();
    weights.sort_unstable_by(|x, y| x.0.cmp(y.0));
    let norm = weights.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
    if norm > 0.0 {
        for (_, w) in &mut weights {
            *w /= norm;
        }
    }
    weights
}
