//! Result reconciler.
//!
//! Merges a parsed batch output back into the table the batch was built from. Two join
//! strategies exist:
//!
//! - **Index**: a positional `custom_id` (`task-<row>`) is taken as the row position in the
//!   table; any other id is skipped. This only holds if the table has not changed since
//!   submission, so the join refuses to run when an index points past the end of the table.
//!   When a submission manifest is supplied it also refuses a batch built with name-based ids,
//!   or a table whose row count or SHA-256 differs from the one recorded at submission.
//! - **Name**: each result is keyed by the join key echoed back in its `input` object, or by its
//!   `custom_id` (which the builder sets to the join key). Robust to reordering.
//!
//! Both are left joins: every table row is kept, rows without a result get a null `result`, and
//! several results for one row (or several rows for one key) multiply rather than collapse.

pub mod results;

use std::collections::HashMap;

use crate::batch::submit::SubmissionManifest;
use crate::batch::tasks::positional_id;
use crate::config::{IdStrategy, JoinStrategy, ReconcilerConfig};
use crate::errors::{Error, Result};
use crate::table::Table;
pub use results::{BatchResult, ParseOptions, ParseReport, parse_results, read_results};

pub const RESULT_COLUMN: &str = "result";
pub const RAW_RESPONSE_COLUMN: &str = "raw_response";

/// Outcome of a reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub parse: ParseReport,
    pub rows_in: usize,
    pub rows_out: usize,
    /// Table rows that received at least one result
    pub rows_matched: usize,
    /// Results that matched no table row
    pub results_unmatched: usize,
}

/// A joined table plus match accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    pub table: Table,
    pub rows_matched: usize,
    pub results_unmatched: usize,
}

fn result_headers(include_raw_response: bool) -> Vec<String> {
    let mut headers = vec![RESULT_COLUMN.to_string()];
    if include_raw_response {
        headers.push(RAW_RESPONSE_COLUMN.to_string());
    }
    headers
}

fn result_cells(result: &BatchResult, include_raw_response: bool) -> Vec<String> {
    let mut cells = vec![result.result_text.clone()];
    if include_raw_response {
        cells.push(result.raw_response.to_string());
    }
    cells
}

/// Check that `table` is the snapshot the batch was built from.
pub fn verify_snapshot(table: &Table, sha256: &str, manifest: &SubmissionManifest) -> Result<()> {
    if manifest.id_strategy != IdStrategy::Positional {
        return Err(Error::SnapshotMismatch {
            message: format!(
                "batch {} was built with {:?} ids, not positional ones; reconcile it by name",
                manifest.batch_id, manifest.id_strategy
            ),
        });
    }
    if table.len() != manifest.source.rows {
        return Err(Error::SnapshotMismatch {
            message: format!(
                "table has {} rows but batch {} was built from {} rows",
                table.len(),
                manifest.batch_id,
                manifest.source.rows
            ),
        });
    }
    if sha256 != manifest.source.sha256 {
        return Err(Error::SnapshotMismatch {
            message: format!(
                "table content changed since batch {} was submitted (sha256 {} != {})",
                manifest.batch_id, sha256, manifest.source.sha256
            ),
        });
    }
    tracing::info!(batch_id = %manifest.batch_id, rows = table.len(), "Table matches submission snapshot");
    Ok(())
}

/// Join results onto table rows by the row position encoded in their `custom_id`.
///
/// Only ids of the exact form produced by [`positional_id`] count; a photo name that merely
/// ends in `-<digits>` is skipped.
pub fn reconcile_by_index(table: &Table, results: &[BatchResult], include_raw_response: bool) -> Result<Joined> {
    let mut lookup: HashMap<usize, Vec<Vec<String>>> = HashMap::new();
    for result in results {
        let Some(index) = result.index.filter(|&i| positional_id(i) == result.custom_id) else {
            tracing::warn!(custom_id = %result.custom_id, "custom_id is not a positional task id, skipping result");
            continue;
        };
        if index >= table.len() {
            return Err(Error::Misaligned { index, rows: table.len() });
        }
        lookup.entry(index).or_default().push(result_cells(result, include_raw_response));
    }

    if lookup.is_empty() {
        return Err(Error::BadInput {
            message: "no result carries a positional custom_id (task-<row>); use the name strategy".to_string(),
        });
    }

    let rows_matched = lookup.len();
    let joined = table.left_join(&result_headers(include_raw_response), &lookup, |i, _| Some(i))?;

    Ok(Joined {
        table: joined,
        rows_matched,
        results_unmatched: 0,
    })
}

/// Join results onto table rows by join key.
pub fn reconcile_by_name(table: &Table, results: &[BatchResult], key_column: &str, include_raw_response: bool) -> Result<Joined> {
    let key = table.column(key_column)?;

    let mut lookup: HashMap<String, Vec<Vec<String>>> = HashMap::new();
    for result in results {
        let result_key = result.echoed_key.clone().unwrap_or_else(|| result.custom_id.clone());
        lookup.entry(result_key).or_default().push(result_cells(result, include_raw_response));
    }

    let keys_in_table: std::collections::HashSet<&str> = table.rows().iter().filter_map(|r| Table::cell(r, key)).collect();
    let rows_matched = table
        .rows()
        .iter()
        .filter(|r| Table::cell(r, key).is_some_and(|k| lookup.contains_key(k)))
        .count();
    let results_unmatched = lookup
        .iter()
        .filter(|(k, _)| !keys_in_table.contains(k.as_str()))
        .map(|(_, v)| v.len())
        .sum::<usize>();

    let joined = table.left_join(&result_headers(include_raw_response), &lookup, |_, row| {
        Table::cell(row, key).map(str::to_string)
    })?;

    Ok(Joined {
        table: joined,
        rows_matched,
        results_unmatched,
    })
}

/// Full reconciler stage: parse results, load the table, join, write.
pub fn run(config: &ReconcilerConfig) -> Result<ReconcileReport> {
    let options = ParseOptions {
        key_column: Some(&config.key_column),
        require_json_content: config.require_json_content,
    };
    let (results, parse) = read_results(&config.results_path, options)?;

    let (table, sha256) = Table::read_csv_with_digest(&config.input_path)?;
    tracing::info!(path = %config.input_path.display(), rows = table.len(), "Loaded source table");

    tracing::info!(strategy = ?config.strategy, "Merging results");
    let joined = match config.strategy {
        JoinStrategy::Index => {
            match &config.manifest_path {
                Some(path) => verify_snapshot(&table, &sha256, &SubmissionManifest::read(path)?)?,
                None => tracing::warn!("No submission manifest given; only the row range of result indices is checked"),
            }
            reconcile_by_index(&table, &results, config.include_raw_response)?
        }
        JoinStrategy::Name => reconcile_by_name(&table, &results, &config.key_column, config.include_raw_response)?,
    };

    if joined.results_unmatched > 0 {
        tracing::warn!(results = joined.results_unmatched, "Some results matched no table row");
    }

    joined.table.write_csv(&config.output_path)?;

    let report = ReconcileReport {
        parse,
        rows_in: table.len(),
        rows_out: joined.table.len(),
        rows_matched: joined.rows_matched,
        results_unmatched: joined.results_unmatched,
    };
    tracing::info!(
        output = %config.output_path.display(),
        rows_in = report.rows_in,
        rows_out = report.rows_out,
        rows_matched = report.rows_matched,
        "Final table written"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::submit::SourceSnapshot;
    use crate::test_utils::{result_line, table};
    use chrono::Utc;
    use std::path::PathBuf;

    fn five_rows() -> Table {
        table(
            &["photoName", "crime"],
            &[
                &["p0.jpg", "theft"],
                &["p1.jpg", "robbery"],
                &["p2.jpg", "assault"],
                &["p3.jpg", "vandalism"],
                &["p4.jpg", "theft"],
            ],
        )
    }

    fn parsed(lines: &[String]) -> Vec<BatchResult> {
        let input = lines.join("\n");
        parse_results(input.as_bytes(), ParseOptions::default()).unwrap().0
    }

    fn manifest(rows: usize, sha256: &str) -> SubmissionManifest {
        SubmissionManifest {
            batch_id: "batch-1".to_string(),
            input_file_id: "file-1".to_string(),
            tasks: rows,
            id_strategy: IdStrategy::Positional,
            source: SourceSnapshot {
                path: PathBuf::from("clean.csv"),
                rows,
                sha256: sha256.to_string(),
            },
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_index_alignment_row_for_row() {
        // Results arrive out of order; alignment follows the index, not file order.
        let lines: Vec<String> = [3, 0, 4, 1, 2].iter().map(|i| result_line(&format!("task-{i}"), &format!("desc-{i}"))).collect();
        let joined = reconcile_by_index(&five_rows(), &parsed(&lines), false).unwrap();

        assert_eq!(joined.table.headers(), &["photoName", "crime", "result"]);
        assert_eq!(joined.table.len(), 5);
        assert_eq!(joined.rows_matched, 5);
        for (i, row) in joined.table.rows().iter().enumerate() {
            assert_eq!(row[0], format!("p{i}.jpg"));
            assert_eq!(row[2], format!("desc-{i}"));
        }
    }

    #[test]
    fn test_index_keeps_rows_without_result() {
        let lines = vec![result_line("task-1", "only one")];
        let joined = reconcile_by_index(&five_rows(), &parsed(&lines), true).unwrap();

        assert_eq!(joined.table.headers(), &["photoName", "crime", "result", "raw_response"]);
        assert_eq!(joined.table.len(), 5);
        assert_eq!(joined.rows_matched, 1);
        assert_eq!(joined.table.rows()[0][2], "");
        assert_eq!(joined.table.rows()[1][2], "only one");

        let raw: serde_json::Value = serde_json::from_str(&joined.table.rows()[1][3]).unwrap();
        assert_eq!(raw["custom_id"], "task-1");
    }

    #[test]
    fn test_index_out_of_range_is_misaligned() {
        let lines = vec![result_line("task-0", "a"), result_line("task-5", "b")];
        let err = reconcile_by_index(&five_rows(), &parsed(&lines), false).unwrap_err();
        assert!(matches!(err, Error::Misaligned { index: 5, rows: 5 }));
    }

    #[test]
    fn test_index_without_numeric_ids() {
        let lines = vec![result_line("p0.jpg", "a")];
        let err = reconcile_by_index(&five_rows(), &parsed(&lines), false).unwrap_err();
        assert!(matches!(err, Error::BadInput { .. }));
    }

    #[test]
    fn test_name_join_shares_result_across_duplicate_keys() {
        let t = table(
            &["photoName", "crime"],
            &[&["a.jpg", "theft"], &["b.jpg", "robbery"], &["a.jpg", "assault"]],
        );
        let lines = vec![result_line("a.jpg", "a street"), result_line("zzz.jpg", "orphan")];
        let joined = reconcile_by_name(&t, &parsed(&lines), "photoName", false).unwrap();

        let rows = joined.table.rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][2], "a street");
        assert_eq!(rows[1][2], "");
        assert_eq!(rows[2][2], "a street");
        assert_eq!(joined.rows_matched, 2);
        assert_eq!(joined.results_unmatched, 1);
    }

    #[test]
    fn test_name_join_prefers_echoed_key() {
        let mut line: serde_json::Value = serde_json::from_str(&result_line("task-9", "echoed")).unwrap();
        line["input"] = serde_json::json!({"photoName": "p2.jpg"});
        let results = parse_results(
            line.to_string().as_bytes(),
            ParseOptions {
                key_column: Some("photoName"),
                ..Default::default()
            },
        )
        .unwrap()
        .0;

        let joined = reconcile_by_name(&five_rows(), &results, "photoName", false).unwrap();
        assert_eq!(joined.table.rows()[2][2], "echoed");
        assert_eq!(joined.rows_matched, 1);
    }

    #[test]
    fn test_name_join_multiplies_multiple_results() {
        let lines = vec![result_line("p0.jpg", "first"), result_line("p0.jpg", "second")];
        let joined = reconcile_by_name(&five_rows(), &parsed(&lines), "photoName", false).unwrap();

        assert_eq!(joined.table.len(), 6);
        assert_eq!(joined.table.rows()[0][2], "first");
        assert_eq!(joined.table.rows()[1][2], "second");
    }

    #[test]
    fn test_index_ignores_names_with_numeric_suffix() {
        let t = table(
            &["photoName"],
            &[&["cam-3"], &["b.jpg"], &["c.jpg"], &["d.jpg"]],
        );
        let lines = vec![result_line("cam-3", "desc of cam-3"), result_line("task-1", "desc of b")];
        let joined = reconcile_by_index(&t, &parsed(&lines), false).unwrap();

        let rows = joined.table.rows();
        assert_eq!(rows[1][1], "desc of b");
        assert_eq!(rows[3][1], "");
        assert_eq!(joined.rows_matched, 1);

        let only_names = vec![result_line("cam-3", "desc of cam-3"), result_line("task-01", "padded")];
        let err = reconcile_by_index(&t, &parsed(&only_names), false).unwrap_err();
        assert!(matches!(err, Error::BadInput { .. }));
    }

    #[test]
    fn test_verify_snapshot_rejects_name_based_batch() {
        let t = five_rows();
        let mut by_name = manifest(5, "abc");
        by_name.id_strategy = IdStrategy::PhotoName;

        let err = verify_snapshot(&t, "abc", &by_name).unwrap_err();
        assert!(matches!(err, Error::SnapshotMismatch { .. }));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_verify_snapshot() {
        let t = five_rows();
        assert!(verify_snapshot(&t, "abc", &manifest(5, "abc")).is_ok());
        assert!(matches!(
            verify_snapshot(&t, "abc", &manifest(6, "abc")),
            Err(Error::SnapshotMismatch { .. })
        ));
        assert!(matches!(
            verify_snapshot(&t, "abc", &manifest(5, "def")),
            Err(Error::SnapshotMismatch { .. })
        ));
    }

    fn run_config(dir: &std::path::Path, strategy: JoinStrategy) -> ReconcilerConfig {
        ReconcilerConfig {
            results_path: dir.join("results.jsonl"),
            input_path: dir.join("clean.csv"),
            output_path: dir.join("inferences/final.csv"),
            strategy,
            include_raw_response: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_run_index_with_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(dir.path(), JoinStrategy::Index);
        five_rows().write_csv(&config.input_path).unwrap();
        let lines: Vec<String> = (0..5).map(|i| result_line(&format!("task-{i}"), &format!("r{i}"))).collect();
        std::fs::write(&config.results_path, lines.join("\n") + "\nnot json\n").unwrap();

        let (_, digest) = Table::read_csv_with_digest(&config.input_path).unwrap();
        let manifest_path = manifest(5, &digest).write(dir.path()).unwrap();
        config.manifest_path = Some(manifest_path);

        let report = run(&config).unwrap();
        assert_eq!(report.parse.parsed, 5);
        assert_eq!(report.parse.invalid_json, 1);
        assert_eq!(report.rows_out, 5);

        let out = std::fs::read_to_string(&config.output_path).unwrap();
        assert_eq!(out.lines().next(), Some("photoName,crime,result"));
        assert_eq!(out.lines().nth(3), Some("p2.jpg,assault,r2"));
    }

    #[test]
    fn test_run_index_rejects_changed_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(dir.path(), JoinStrategy::Index);
        five_rows().write_csv(&config.input_path).unwrap();
        std::fs::write(&config.results_path, result_line("task-0", "r0")).unwrap();
        config.manifest_path = Some(manifest(5, "stale-digest").write(dir.path()).unwrap());

        let err = run(&config).unwrap_err();
        assert!(matches!(err, Error::SnapshotMismatch { .. }));
        assert_eq!(err.exit_code(), 4);
        assert!(!config.output_path.exists());
    }

    #[test]
    fn test_run_empty_results_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = run_config(dir.path(), JoinStrategy::Name);
        five_rows().write_csv(&config.input_path).unwrap();
        std::fs::write(&config.results_path, "{}\n[]\n").unwrap();

        let err = run(&config).unwrap_err();
        assert!(matches!(err, Error::EmptyResults { .. }));
        assert!(!config.output_path.exists());
    }

    #[test]
    fn test_run_missing_table() {
        let dir = tempfile::tempdir().unwrap();
        let config = run_config(dir.path(), JoinStrategy::Name);
        std::fs::write(&config.results_path, result_line("p0.jpg", "r0")).unwrap();

        let err = run(&config).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
