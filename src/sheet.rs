use std::collections::{HashMap, HashSet};
use std::path::Path;

use calamine::{open_workbook_auto, DataType, Reader};
use rust_xlsxwriter::{Format, Workbook};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::record::{AnswerSet, Record, RecordStore, RemovalSet};

/// Column headers of the exported workbook.
pub const EXPORT_HEADERS: [&str; 4] = ["QID", "BRIEFTEXT", "QUESTION/ANSWER", "SCR"];

const MAX_SHEET_NAME: usize = 31;

/// Raw cells of one worksheet. `rows` excludes the header row.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<DataType>>,
}

impl Table {
    fn column(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name.trim()))
    }

    fn require_column(&self, name: &str) -> Result<usize> {
        self.column(name)
            .ok_or_else(|| Error::MissingColumn(name.to_string()))
    }
}

/// Read the first worksheet of an xlsx/xls/ods workbook.
pub fn read_first_sheet(path: &Path) -> Result<Table> {
    let mut workbook = open_workbook_auto(path).map_err(|source| Error::Workbook {
        path: path.to_path_buf(),
        source,
    })?;

    let sheet_names = workbook.sheet_names().to_owned();
    tracing::info!(path = %path.display(), sheets = ?sheet_names, "reading workbook");

    let sheet = sheet_names
        .first()
        .cloned()
        .ok_or_else(|| Error::NoWorksheet(path.to_path_buf()))?;

    let range = workbook
        .worksheet_range(&sheet)
        .ok_or_else(|| Error::Worksheet {
            sheet: sheet.clone(),
            reason: "worksheet not found".to_string(),
        })?
        .map_err(|e| Error::Worksheet {
            sheet: sheet.clone(),
            reason: e.to_string(),
        })?;

    let mut rows = range.rows();
    let headers = rows
        .next()
        .map(|row| row.iter().map(cell_text).collect())
        .unwrap_or_default();
    let rows: Vec<Vec<DataType>> = rows.map(<[DataType]>::to_vec).collect();

    tracing::info!(sheet = %sheet, rows = rows.len(), "worksheet loaded");
    Ok(Table { headers, rows })
}

/// Output of question parsing.
#[derive(Debug)]
pub struct ParsedBank {
    pub store: RecordStore,
    /// Questions dropped by the short QID rule.
    pub skipped: usize,
}

/// Turn worksheet rows into records.
///
/// A row with a QID starts a question. Following rows with a score are its
/// answers, up to `max_answers`. Records are returned sorted by QID.
pub fn parse_questions(table: &Table, config: &Config) -> Result<ParsedBank> {
    let columns = &config.columns;
    let qid_col = table.require_column(&columns.qid)?;
    let category_col = table.require_column(&columns.category)?;
    let text_col = table.require_column(&columns.text)?;
    let score_col = table.require_column(&columns.score)?;
    let doc_col = table.column(&columns.document_ref);

    let mut records = Vec::new();
    let mut skipped = 0;

    for (i, row) in table.rows.iter().enumerate() {
        let Some(qid_cell) = cell(row, qid_col) else {
            continue;
        };
        let qid = int_cell(qid_cell, i, &columns.qid)?;

        if config.skip_short_qids && qid < config.short_qid_limit {
            tracing::debug!(qid, row = i + 2, "skipping short QID");
            skipped += 1;
            continue;
        }

        let category = cell(row, category_col)
            .map(cell_text)
            .unwrap_or_default()
            .trim()
            .to_string();
        let text = strip_text(&cell(row, text_col).map(cell_text).unwrap_or_default());

        let mut answers = AnswerSet::new();
        for (offset, answer_row) in table.rows[i + 1..].iter().enumerate() {
            if cell(answer_row, qid_col).is_some() {
                break;
            }
            let Some(score_cell) = cell(answer_row, score_col) else {
                break;
            };
            let index = i + 1 + offset;
            if offset == config.max_answers {
                tracing::warn!(qid, row = index + 2, "answers beyond MAX dropped");
                break;
            }

            let score = int_cell(score_cell, index, &columns.score)?;
            let answer = strip_text(&cell(answer_row, text_col).map(cell_text).unwrap_or_default());
            if !answers.insert(answer.clone(), score) {
                tracing::warn!(qid, answer = %answer, "duplicate answer, keeping the last score");
            }
        }

        let document_ref = doc_col
            .and_then(|c| cell(row, c))
            .map(|c| int_cell(c, i, &columns.document_ref))
            .transpose()?;

        records.push(Record {
            sequence_id: records.len(),
            domain_id: qid,
            text,
            category,
            answers,
            document_ref,
            source_row: i + 2,
        });
    }

    records.sort_by_key(|r| r.domain_id);
    tracing::info!(questions = records.len(), skipped, "questions parsed");

    Ok(ParsedBank {
        store: RecordStore::new(records),
        skipped,
    })
}

/// Load the document-reference lookup: key in the first column, text in the second.
pub fn load_classifiers(path: &Path) -> Result<HashMap<i64, String>> {
    let table = read_first_sheet(path)?;
    let mut classifiers = HashMap::new();
    for row in &table.rows {
        let Some(key) = cell(row, 0).and_then(cell_int) else {
            continue;
        };
        let text = cell(row, 1).map(cell_text).unwrap_or_default();
        classifiers.insert(key, text.trim().to_string());
    }
    tracing::info!(entries = classifiers.len(), "classifiers loaded");
    Ok(classifiers)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub sheets: usize,
    pub written: usize,
    pub excluded: usize,
}

/// Write kept records, one sheet per category when `split` is set.
pub fn export(
    path: &Path,
    store: &RecordStore,
    removals: &RemovalSet,
    split: bool,
) -> Result<ExportSummary> {
    let kept: Vec<&Record> = store
        .iter()
        .filter(|r| !removals.contains(r.domain_id))
        .collect();

    let groups: Vec<(String, Vec<&Record>)> = if split {
        store
            .categories()
            .into_iter()
            .filter_map(|category| {
                let members: Vec<&Record> = kept
                    .iter()
                    .copied()
                    .filter(|r| r.category == category)
                    .collect();
                // no empty sheets
                (!members.is_empty()).then(|| (category.to_string(), members))
            })
            .collect()
    } else {
        vec![("Questions".to_string(), kept.clone())]
    };

    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let mut used_names = HashSet::new();

    for (name, records) in &groups {
        let title = sheet_name(name, &mut used_names);
        let sheet = workbook.add_worksheet();
        sheet.set_name(&title)?;

        for (col, header) in EXPORT_HEADERS.iter().enumerate() {
            sheet.write_string_with_format(0, col as u16, *header, &header_format)?;
        }

        let mut row: u32 = 1;
        for record in records {
            sheet.write_number(row, 0, record.domain_id as f64)?;
            sheet.write_string(row, 1, &record.category)?;
            sheet.write_string(row, 2, &record.text)?;
            row += 1;
            for (answer, score) in record.answers.iter() {
                sheet.write_string(row, 2, answer)?;
                sheet.write_number(row, 3, score as f64)?;
                row += 1;
            }
        }
        tracing::debug!(sheet = %title, questions = records.len(), "sheet written");
    }

    workbook.save(path)?;

    Ok(ExportSummary {
        sheets: groups.len(),
        written: kept.len(),
        excluded: store.len() - kept.len(),
    })
}

/// Make a category usable as a worksheet name, unique within the workbook.
fn sheet_name(category: &str, used: &mut HashSet<String>) -> String {
    let cleaned: String = category
        .chars()
        .map(|c| match c {
            '/' => '-',
            '\\' | '[' | ']' | ':' | '*' | '?' => '_',
            c => c,
        })
        .collect();
    let mut base = cleaned.trim().trim_matches('\'').to_string();
    if base.is_empty() {
        base = "Uncategorized".to_string();
    }
    // Reserved by Excel
    if base.eq_ignore_ascii_case("history") {
        base.push('_');
    }
    let base: String = base.chars().take(MAX_SHEET_NAME).collect();

    let mut candidate = base.clone();
    let mut n = 2;
    while !used.insert(candidate.to_lowercase()) {
        let suffix = format!(" ({n})");
        let keep = MAX_SHEET_NAME - suffix.chars().count();
        candidate = format!("{}{}", base.chars().take(keep).collect::<String>(), suffix);
        n += 1;
    }
    candidate
}

/// Non-blank cell at `col`, if any.
fn cell(row: &[DataType], col: usize) -> Option<&DataType> {
    match row.get(col)? {
        DataType::Empty => None,
        DataType::String(s) if s.trim().is_empty() => None,
        c => Some(c),
    }
}

fn cell_text(cell: &DataType) -> String {
    match cell {
        DataType::Empty => String::new(),
        DataType::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn cell_int(cell: &DataType) -> Option<i64> {
    match cell {
        DataType::Int(i) => Some(*i),
        DataType::Float(f) if f.is_finite() => Some(f.trunc() as i64),
        DataType::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
        }
        _ => None,
    }
}

fn int_cell(cell: &DataType, index: usize, column: &str) -> Result<i64> {
    cell_int(cell).ok_or_else(|| Error::InvalidCell {
        row: index + 2,
        column: column.to_string(),
        value: cell_text(cell),
    })
}

/// Trim surrounding spaces, line breaks and `?:.`.
fn strip_text(text: &str) -> String {
    text.trim_matches(|c| matches!(c, ' ' | '\n' | '\r' | '?' | ':' | '.'))
        .to_string()
}
