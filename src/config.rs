use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Run configuration, read from `.qdedup.toml` when present.
///
/// Every field has a default so a partial file (or no file) works.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Questions with fewer answers are reported.
    pub min_answers: usize,
    /// Questions with this many answers are reported; further answer rows are dropped.
    pub max_answers: usize,
    /// Minimum score (0..=100) for two questions to count as duplicates.
    pub similarity_threshold: u8,
    /// Skip questions whose QID is below `short_qid_limit`.
    pub skip_short_qids: bool,
    pub short_qid_limit: i64,
    /// Report tabs and line breaks inside answer text.
    pub check_illegal_chars: bool,
    /// Write one worksheet per category instead of a single sheet.
    pub split_by_category: bool,
    /// Operator input that stops the resolution loop early.
    pub termination_keyword: String,
    /// Optional workbook mapping document references to classifier text.
    pub classifiers: Option<PathBuf>,
    pub columns: Columns,
}

/// Header names of the input worksheet.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Columns {
    pub qid: String,
    pub category: String,
    pub text: String,
    pub score: String,
    pub document_ref: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_answers: 3,
            max_answers: 6,
            similarity_threshold: 99,
            skip_short_qids: true,
            short_qid_limit: 10_000,
            check_illegal_chars: false,
            split_by_category: true,
            termination_keyword: "exit".to_string(),
            classifiers: None,
            columns: Columns::default(),
        }
    }
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            qid: "QID".to_string(),
            category: "BRIEFTEXT".to_string(),
            text: "QUESTION/ANSWER".to_string(),
            score: "SCR".to_string(),
            document_ref: "DOCREF".to_string(),
        }
    }
}

impl Config {
    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: Self = toml::from_str(&content).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply a command-line threshold override.
    pub fn with_threshold(mut self, threshold: Option<u8>) -> Result<Self> {
        if let Some(threshold) = threshold {
            self.similarity_threshold = threshold;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_answers >= self.max_answers {
            return Err(Error::Config(format!(
                "min_answers ({}) must be less than max_answers ({})",
                self.min_answers, self.max_answers
            )));
        }
        if self.similarity_threshold > 100 {
            return Err(Error::Config(format!(
                "similarity_threshold must be within 0..=100, got {}",
                self.similarity_threshold
            )));
        }
        if self.termination_keyword.trim().is_empty() {
            return Err(Error::Config(
                "termination_keyword must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
