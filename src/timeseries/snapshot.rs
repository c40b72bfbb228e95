use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;

use crate::date_util::extract_date_token;
use crate::error::Result;

/// What to do with the rest of a file after a line fails to parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedLinePolicy {
    /// Keep what the file contributed so far and stop reading it.
    #[default]
    SkipRestOfFile,
    /// Drop only the offending line.
    SkipLine,
}

#[derive(Debug, Clone)]
pub struct SnapshotQuery {
    pub dir: PathBuf,
    /// Matched against each file name; non-matching files are ignored.
    pub pattern: Regex,
    /// Inclusive date range.
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Header positions of the columns to sum.
    pub field_indices: Vec<usize>,
    pub malformed_lines: MalformedLinePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRow {
    pub date: NaiveDate,
    pub values: Vec<i64>,
}

/// Fixed-shape table: every row has one value per column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotTable {
    pub columns: Vec<String>,
    pub rows: Vec<SnapshotRow>,
}

impl SnapshotTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoDateToken,
    Unreadable(String),
    EmptyFile,
    SchemaMismatch(String),
    /// 1-based line number. Lines before it were kept.
    MalformedLine { line: usize, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub file: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotRead {
    pub table: SnapshotTable,
    pub files_read: usize,
    pub skipped: Vec<SkippedFile>,
}

/// Scan `query.dir` and sum the selected columns of every in-range snapshot,
/// one row per date.
///
/// Only a failure to list the directory is an error. Problems with a single
/// file are recorded in [`SnapshotRead::skipped`] and the scan continues.
pub fn read_snapshots(query: &SnapshotQuery) -> Result<SnapshotRead> {
    let mut names = Vec::new();
    for entry in fs::read_dir(&query.dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    let width = query.field_indices.len();
    let mut columns: Option<Vec<String>> = None;
    let mut sums: BTreeMap<NaiveDate, Vec<i64>> = BTreeMap::new();
    let mut read = SnapshotRead::default();

    for name in names {
        if !query.pattern.is_match(&name) {
            continue;
        }
        let Some(date) = extract_date_token(&name) else {
            log::warn!("skipping {name}: no date token in file name");
            read.skipped.push(SkippedFile {
                file: name,
                reason: SkipReason::NoDateToken,
            });
            continue;
        };
        if date < query.start || date > query.end {
            log::debug!("ignoring {name}: {date} outside {}..={}", query.start, query.end);
            continue;
        }

        let content = match fs::read_to_string(query.dir.join(&name)) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("skipping {name}: {e}");
                read.skipped.push(SkippedFile {
                    file: name,
                    reason: SkipReason::Unreadable(e.to_string()),
                });
                continue;
            }
        };

        let mut lines = content.lines().enumerate();
        let Some((_, header)) = lines.next() else {
            log::warn!("skipping {name}: empty file");
            read.skipped.push(SkippedFile {
                file: name,
                reason: SkipReason::EmptyFile,
            });
            continue;
        };

        let resolved = match resolve_header(header, &query.field_indices) {
            Ok(resolved) => resolved,
            Err(message) => {
                log::warn!("skipping {name}: {message}");
                read.skipped.push(SkippedFile {
                    file: name,
                    reason: SkipReason::SchemaMismatch(message),
                });
                continue;
            }
        };
        match &columns {
            None => columns = Some(resolved),
            Some(expected) if *expected != resolved => {
                let message = format!("columns {resolved:?} differ from {expected:?}");
                log::warn!("skipping {name}: {message}");
                read.skipped.push(SkippedFile {
                    file: name,
                    reason: SkipReason::SchemaMismatch(message),
                });
                continue;
            }
            Some(_) => {}
        }

        read.files_read += 1;
        let row = sums.entry(date).or_insert_with(|| vec![0; width]);
        for (idx, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            let added = parse_line(line, &query.field_indices)
                .and_then(|values| accumulate(&mut *row, &values, &query.field_indices));
            match added {
                Ok(()) => {}
                Err(message) => {
                    log::warn!("{name} line {}: {message}", idx + 1);
                    read.skipped.push(SkippedFile {
                        file: name.clone(),
                        reason: SkipReason::MalformedLine {
                            line: idx + 1,
                            message,
                        },
                    });
                    if query.malformed_lines == MalformedLinePolicy::SkipRestOfFile {
                        break;
                    }
                }
            }
        }
    }

    read.table = SnapshotTable {
        columns: columns.unwrap_or_default(),
        rows: sums
            .into_iter()
            .map(|(date, values)| SnapshotRow { date, values })
            .collect(),
    };
    log::info!(
        "read {} snapshot files into {} rows ({} skipped)",
        read.files_read,
        read.table.rows.len(),
        read.skipped.len()
    );
    Ok(read)
}

fn resolve_header(header: &str, indices: &[usize]) -> std::result::Result<Vec<String>, String> {
    let fields: Vec<&str> = header.split('\t').collect();
    indices
        .iter()
        .map(|&i| {
            fields.get(i).map(|f| f.trim().to_string()).ok_or_else(|| {
                format!(
                    "field index {i} out of range for a {}-column header",
                    fields.len()
                )
            })
        })
        .collect()
}

/// Add `values` into `row`, leaving `row` untouched if any column would overflow.
fn accumulate(
    row: &mut [i64],
    values: &[i64],
    indices: &[usize],
) -> std::result::Result<(), String> {
    let mut next = Vec::with_capacity(row.len());
    for ((sum, value), field) in row.iter().zip(values).zip(indices) {
        let total = sum
            .checked_add(*value)
            .ok_or_else(|| format!("field {field} overflows the running total"))?;
        next.push(total);
    }
    row.copy_from_slice(&next);
    Ok(())
}

fn parse_line(line: &str, indices: &[usize]) -> std::result::Result<Vec<i64>, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    indices
        .iter()
        .map(|&i| {
            let raw = fields
                .get(i)
                .ok_or_else(|| format!("missing field {i}"))?
                .trim();
            raw.parse::<i64>()
                .map_err(|_| format!("field {i} is not an integer: '{raw}'"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    fn query(dir: &Path) -> SnapshotQuery {
        SnapshotQuery {
            dir: dir.to_path_buf(),
            pattern: Regex::new(r"\.tsv$").unwrap(),
            start: date(2013, 1, 1),
            end: date(2013, 1, 31),
            field_indices: vec![1, 2],
            malformed_lines: MalformedLinePolicy::default(),
        }
    }

    const HEADER: &str = "project\tregistrations\tproductive\trevisions\n";

    #[test]
    fn test_date_filter_and_summation() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "metrics_20130115_daily.tsv",
            &format!("{HEADER}enwiki\t5\t2\t100\n\ndewiki\t7\t1\t50\n"),
        );
        write(
            dir.path(),
            "metrics_20121231_daily.tsv",
            &format!("{HEADER}enwiki\t99\t99\t99\n"),
        );
        write(dir.path(), "metrics_daily.tsv", HEADER);
        write(dir.path(), "metrics_20130116_daily.txt", HEADER);

        let read = read_snapshots(&query(dir.path())).unwrap();

        assert_eq!(read.files_read, 1);
        assert_eq!(read.table.columns, vec!["registrations", "productive"]);
        assert_eq!(
            read.table.rows,
            vec![SnapshotRow {
                date: date(2013, 1, 15),
                values: vec![12, 3],
            }]
        );
        assert_eq!(
            read.skipped,
            vec![SkippedFile {
                file: "metrics_daily.tsv".into(),
                reason: SkipReason::NoDateToken,
            }]
        );
    }

    #[test]
    fn test_rows_sorted_and_same_date_merged() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b_20130110.tsv", &format!("{HEADER}x\t1\t1\t0\n"));
        write(dir.path(), "a_20130110.tsv", &format!("{HEADER}x\t2\t2\t0\n"));
        write(dir.path(), "a_20130105.tsv", &format!("{HEADER}x\t4\t0\t0\n"));

        let read = read_snapshots(&query(dir.path())).unwrap();
        let dates: Vec<_> = read.table.rows.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![date(2013, 1, 5), date(2013, 1, 10)]);
        assert_eq!(read.table.rows[1].values, vec![3, 3]);
    }

    #[test]
    fn test_schema_mismatch_skips_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a_20130102.tsv", &format!("{HEADER}x\t1\t1\t0\n"));
        write(
            dir.path(),
            "b_20130103.tsv",
            "project\tcreated\tproductive\nx\t5\t5\n",
        );
        write(dir.path(), "c_20130104.tsv", "project\nx\n");

        let read = read_snapshots(&query(dir.path())).unwrap();
        assert_eq!(read.files_read, 1);
        assert_eq!(read.skipped.len(), 2);
        assert!(read
            .skipped
            .iter()
            .all(|s| matches!(s.reason, SkipReason::SchemaMismatch(_))));
    }

    #[test]
    fn test_malformed_line_skips_rest_of_file_by_default() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "m_20130120.tsv",
            &format!("{HEADER}x\t5\t2\t0\nx\toops\t1\t0\nx\t7\t1\t0\n"),
        );

        let read = read_snapshots(&query(dir.path())).unwrap();
        assert_eq!(read.table.rows[0].values, vec![5, 2]);
        assert_eq!(read.skipped.len(), 1);
        assert!(matches!(
            read.skipped[0].reason,
            SkipReason::MalformedLine { line: 3, .. }
        ));
    }

    #[test]
    fn test_malformed_line_skip_line_policy() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "m_20130120.tsv",
            &format!("{HEADER}x\t5\t2\t0\nx\toops\t1\t0\nx\t7\t1\t0\nshort\n"),
        );

        let mut q = query(dir.path());
        q.malformed_lines = MalformedLinePolicy::SkipLine;
        let read = read_snapshots(&q).unwrap();
        assert_eq!(read.table.rows[0].values, vec![12, 3]);
        let lines: Vec<usize> = read
            .skipped
            .iter()
            .filter_map(|s| match s.reason {
                SkipReason::MalformedLine { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec![3, 5]);
    }

    #[test]
    fn test_sum_overflow_is_a_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        let max = i64::MAX;
        write(dir.path(), "a_20130110.tsv", &format!("{HEADER}x\t{max}\t1\t0\n"));
        write(
            dir.path(),
            "b_20130110.tsv",
            &format!("{HEADER}x\t1\t1\t0\nx\t-5\t2\t0\n"),
        );
        write(dir.path(), "c_20130111.tsv", &format!("{HEADER}x\t4\t4\t0\n"));

        let read = read_snapshots(&query(dir.path())).unwrap();
        assert_eq!(read.files_read, 3);
        // the overflowing line and the rest of its file are dropped
        assert_eq!(read.table.rows[0].values, vec![max, 1]);
        assert_eq!(read.table.rows[1].values, vec![4, 4]);
        assert_eq!(read.skipped.len(), 1);
        assert_eq!(read.skipped[0].file, "b_20130110.tsv");
        assert!(matches!(
            &read.skipped[0].reason,
            SkipReason::MalformedLine { line: 2, message } if message.contains("overflows")
        ));

        let mut q = query(dir.path());
        q.malformed_lines = MalformedLinePolicy::SkipLine;
        let read = read_snapshots(&q).unwrap();
        assert_eq!(read.table.rows[0].values, vec![max - 5, 3]);
    }

    #[test]
    fn test_missing_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let q = query(&dir.path().join("absent"));
        assert!(read_snapshots(&q).is_err());
    }
}
