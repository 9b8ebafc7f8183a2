//! Offline tools for directories of per-process result files.
//!
//! When every harness process writes its own private store, the files are
//! combined afterwards with [`merge_dir`]. [`check_headers`] finds stores
//! that picked up more than one header row.

use crate::sink::read_rows;
use crate::sink::record::EXTENDED_COLUMNS;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("'{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("no .csv files found in '{}'", .0.display())]
    NoInputs(PathBuf),

    #[error("failed to read '{}': {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse '{}': {source}", path.display())]
    Parse { path: PathBuf, source: csv::Error },

    #[error("failed to write '{}': {source}", path.display())]
    Write { path: PathBuf, source: csv::Error },
}

/// Outcome of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    pub files: usize,
    pub rows: usize,
}

/// Header problems found in one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderReport {
    pub path: PathBuf,
    /// The file has no content at all.
    pub empty: bool,
    /// 1-based line numbers that repeat the first line.
    pub duplicate_lines: Vec<usize>,
}

impl HeaderReport {
    pub fn is_clean(&self) -> bool {
        !self.empty && self.duplicate_lines.is_empty()
    }
}

/// Every `*.csv` file in `dir`, sorted by name.
pub fn csv_files(dir: &Path) -> Result<Vec<PathBuf>, MergeError> {
    if !dir.is_dir() {
        return Err(MergeError::NotADirectory(dir.to_path_buf()));
    }

    let entries = fs::read_dir(dir).map_err(|source| MergeError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    files.sort();
    Ok(files)
}

/// Combine every result file in `dir` into `output`.
///
/// Columns are matched by header name and laid out in the extended order;
/// columns a file lacks are left empty. Rows are ordered by the first number
/// in the scenario id, then repetition, then client id.
pub fn merge_dir(dir: &Path, output: &Path) -> Result<MergeSummary, MergeError> {
    let inputs: Vec<PathBuf> = csv_files(dir)?
        .into_iter()
        .filter(|path| !same_file(path, output))
        .collect();
    if inputs.is_empty() {
        return Err(MergeError::NoInputs(dir.to_path_buf()));
    }

    let mut rows = Vec::new();
    for path in &inputs {
        let parsed = read_rows(path).map_err(|source| MergeError::Parse {
            path: path.clone(),
            source,
        })?;
        let before = rows.len();
        collect_rows(parsed, &mut rows);
        debug!(path = %path.display(), rows = rows.len() - before, "Merged file");
    }

    rows.sort_by_key(|row| sort_key(row));
    write_rows(output, &rows).map_err(|source| MergeError::Write {
        path: output.to_path_buf(),
        source,
    })?;

    Ok(MergeSummary {
        files: inputs.len(),
        rows: rows.len(),
    })
}

/// Report empty files and repeated header lines for every result file.
pub fn check_headers(dir: &Path) -> Result<Vec<HeaderReport>, MergeError> {
    csv_files(dir)?
        .into_iter()
        .map(|path| {
            let text = read(&path)?;
            let mut lines = text.lines();
            let report = match lines.next() {
                None => HeaderReport {
                    path,
                    empty: true,
                    duplicate_lines: Vec::new(),
                },
                Some(header) => {
                    let header = header.trim();
                    let duplicate_lines = lines
                        .enumerate()
                        .filter(|(_, line)| line.trim() == header)
                        .map(|(i, _)| i + 2)
                        .collect();
                    HeaderReport {
                        path,
                        empty: false,
                        duplicate_lines,
                    }
                }
            };
            Ok(report)
        })
        .collect()
}

fn read(path: &Path) -> Result<String, MergeError> {
    fs::read_to_string(path).map_err(|source| MergeError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Append the data rows of one file, remapped to the extended column order.
fn collect_rows(parsed: Vec<Vec<String>>, out: &mut Vec<Vec<String>>) {
    let mut parsed = parsed.into_iter();
    let Some(header) = parsed.next() else {
        return;
    };

    let mapping: Vec<Option<usize>> = EXTENDED_COLUMNS
        .iter()
        .map(|column| header.iter().position(|h| h.trim() == *column))
        .collect();

    for row in parsed {
        if row == header {
            warn!("Skipping repeated header row");
            continue;
        }
        out.push(
            mapping
                .iter()
                .map(|index| index.and_then(|i| row.get(i).cloned()).unwrap_or_default())
                .collect(),
        );
    }
}

fn write_rows(output: &Path, rows: &[Vec<String>]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(output)?;
    writer.write_record(EXTENDED_COLUMNS)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Order key: first run of digits in the scenario id, repetition, client id.
fn sort_key(row: &[String]) -> (u64, u64, u64) {
    let scenario: String = row[0]
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    let number = |s: &str| s.trim().parse().unwrap_or(u64::MAX);
    (number(&scenario), number(&row[1]), number(&row[2]))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
