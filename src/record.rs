use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::Config;

static ILLEGAL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\n\r\t]").expect("illegal character pattern is valid"));

/// Answer texts with their scores, in the order they were read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerSet {
    entries: Vec<(String, i64)>,
}

impl AnswerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an answer. Returns `false` when the text was already present,
    /// in which case the new score replaces the old one in place.
    pub fn insert(&mut self, text: String, score: i64) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|(t, _)| *t == text) {
            entry.1 = score;
            return false;
        }
        self.entries.push((text, score));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn get(&self, text: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(t, _)| t == text)
            .map(|(_, score)| *score)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().map(|(t, s)| (t.as_str(), *s))
    }
}

/// One parsed question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Identity assigned at parse time, dense and unique within a run.
    pub sequence_id: usize,
    /// QID from the spreadsheet. Not guaranteed unique.
    pub domain_id: i64,
    pub text: String,
    pub category: String,
    pub answers: AnswerSet,
    pub document_ref: Option<i64>,
    /// 1-based spreadsheet row of the question, for display.
    pub source_row: usize,
}

impl Record {
    /// Category followed by the lower-cased question text.
    pub fn comparison_key(&self) -> String {
        format!("{} {}", self.category, self.text.trim().to_lowercase())
    }
}

/// Parsed questions in discovery order.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: Vec<Record>,
}

impl RecordStore {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// Distinct categories, sorted.
    pub fn categories(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.category.as_str()).collect()
    }
}

impl<'a> IntoIterator for &'a RecordStore {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Domain identifiers the operator chose to discard. Only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalSet {
    ids: BTreeSet<i64>,
}

impl RemovalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the identifier was already marked.
    pub fn insert(&mut self, domain_id: i64) -> bool {
        self.ids.insert(domain_id)
    }

    pub fn contains(&self, domain_id: i64) -> bool {
        self.ids.contains(&domain_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.ids.iter().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    TooFewAnswers { count: usize, min: usize },
    AnswersAtMax { count: usize, max: usize },
    IllegalCharacters { answer: String },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewAnswers { count, min } => {
                write!(f, "answer count {count} is below MIN ({min})")
            }
            Self::AnswersAtMax { count, max } => {
                write!(f, "answer count {count} is at MAX ({max})")
            }
            Self::IllegalCharacters { answer } => {
                write!(f, "illegal characters in answer {answer:?}")
            }
        }
    }
}

/// Check a record against the configured answer bounds.
pub fn validate(record: &Record, config: &Config) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if config.check_illegal_chars {
        warnings.extend(
            record
                .answers
                .iter()
                .filter(|(text, _)| ILLEGAL_CHARS.is_match(text))
                .map(|(text, _)| ValidationWarning::IllegalCharacters {
                    answer: text.to_string(),
                }),
        );
    }

    let count = record.answers.len();
    if count >= config.max_answers {
        warnings.push(ValidationWarning::AnswersAtMax {
            count,
            max: config.max_answers,
        });
    }
    if count < config.min_answers {
        warnings.push(ValidationWarning::TooFewAnswers {
            count,
            min: config.min_answers,
        });
    }

    warnings
}

/// Validate every record, logging each warning. Returns how many records failed.
pub fn validate_all(store: &RecordStore, config: &Config) -> usize {
    let mut failed = 0;
    for record in store {
        let warnings = validate(record, config);
        if warnings.is_empty() {
            continue;
        }
        failed += 1;
        for warning in warnings {
            tracing::warn!(
                qid = record.domain_id,
                row = record.source_row,
                category = %record.category,
                "{warning}"
            );
        }
    }
    failed
}

#[cfg(test)]
pub(crate) fn test_record(sequence_id: usize, domain_id: i64, category: &str, text: &str) -> Record {
    let mut answers = AnswerSet::new();
    for (i, answer) in ["yes", "no", "maybe"].iter().enumerate() {
        answers.insert(answer.to_string(), i as i64);
    }
    Record {
        sequence_id,
        domain_id,
        text: text.to_string(),
        category: category.to_string(),
        answers,
        document_ref: None,
        source_row: sequence_id + 2,
    }
}
