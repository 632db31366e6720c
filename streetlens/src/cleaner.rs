//! Dataset cleaner.
//!
//! Joins the crime metadata table with the image URL table. The crime table is deduplicated on
//! its join key (rows with a null key are dropped), the image table's file names are turned into
//! comparable keys by stripping a path prefix, and the crime table is left-joined against it.

use std::collections::HashMap;

use crate::config::CleanerConfig;
use crate::errors::Result;
use crate::table::Table;

/// Row accounting for one cleaner run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub rows_read: usize,
    pub dropped_null_key: usize,
    pub dropped_duplicate_key: usize,
    pub rows_written: usize,
    pub rows_without_url: usize,
}

/// Derive the join key from an image table path, e.g. `/content/IMG_1.jpg` -> `IMG_1.jpg`.
pub fn strip_path_prefix<'a>(file_name: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return file_name;
    }
    file_name.strip_prefix(prefix).unwrap_or(file_name)
}

/// Clean and join two already-loaded tables.
pub fn clean_tables(mut crimes: Table, images: &Table, config: &CleanerConfig) -> Result<(Table, CleanReport)> {
    let key = crimes.column(&config.key_column)?;
    let file_name = images.column(&config.file_name_column)?;
    let url = images.column(&config.url_column)?;

    let rows_read = crimes.len();
    let (dropped_null_key, dropped_duplicate_key) = crimes.dedup_non_null(key);

    // First image row wins per key so the join never multiplies crime rows.
    let mut lookup: HashMap<String, Vec<Vec<String>>> = HashMap::new();
    for row in images.rows() {
        let Some(path) = Table::cell(row, file_name) else {
            continue;
        };
        let image_key = strip_path_prefix(path, &config.path_prefix);
        if image_key.is_empty() {
            continue;
        }
        lookup
            .entry(image_key.to_string())
            .or_insert_with(|| vec![vec![row[url].clone()]]);
    }

    let joined = crimes.left_join(&[config.url_column.clone()], &lookup, |_, row| {
        Table::cell(row, key).map(str::to_string)
    })?;

    let url_out = joined.column(&config.url_column)?;
    let report = CleanReport {
        rows_read,
        dropped_null_key,
        dropped_duplicate_key,
        rows_written: joined.len(),
        rows_without_url: joined.rows().iter().filter(|r| Table::cell(r, url_out).is_none()).count(),
    };

    Ok((joined, report))
}

/// Read both inputs, clean, and overwrite the output file.
///
/// Both inputs are fully read and joined before anything is written.
pub fn run(config: &CleanerConfig) -> Result<CleanReport> {
    tracing::info!(
        crimes = %config.crimes_path.display(),
        images = %config.images_path.display(),
        "Cleaning datasets"
    );

    let images = Table::read_csv(&config.images_path)?;
    let crimes = Table::read_csv(&config.crimes_path)?;

    let (cleaned, report) = clean_tables(crimes, &images, config)?;
    cleaned.write_csv(&config.output_path)?;

    tracing::info!(
        output = %config.output_path.display(),
        rows_read = report.rows_read,
        dropped_null_key = report.dropped_null_key,
        dropped_duplicate_key = report.dropped_duplicate_key,
        rows_written = report.rows_written,
        rows_without_url = report.rows_without_url,
        "Cleaned table written"
    );
    if report.rows_without_url > 0 {
        tracing::warn!(rows = report.rows_without_url, "Some rows have no matching image URL");
    }

    Ok(report)
}
