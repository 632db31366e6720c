//! In-memory CSV tables.
//!
//! All stages exchange data as CSV files on disk. A [`Table`] keeps the header row and
//! every cell as a string; an empty cell is null, the same way the tabular tooling
//! upstream of this crate reads empty CSV fields. Rows keep their file order, which the
//! positional reconciler relies on.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::hash::Hash;
use std::io::Read;
use std::path::Path;

use crate::errors::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Human-readable origin used in error messages (usually the file path)
    name: String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Build a table from owned rows. Every row must be as wide as the header.
    pub fn from_rows(name: impl Into<String>, headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        let name = name.into();
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != headers.len()) {
            return Err(Error::BadInput {
                message: format!("{name}: row {i} has {} cells but the header has {}", row.len(), headers.len()),
            });
        }
        Ok(Self { name, headers, rows })
    }

    /// Parse CSV with a header row from any reader.
    pub fn from_reader<R: Read>(reader: R, source: &Path) -> Result<Self> {
        let csv_err = |source_err| Error::Csv {
            path: source.to_path_buf(),
            source: source_err,
        };

        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers: Vec<String> = reader.headers().map_err(csv_err)?.iter().map(str::to_string).collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self {
            name: source.display().to_string(),
            headers,
            rows,
        })
    }

    /// Read a CSV file from disk.
    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::read_csv_with_digest(path)?.0)
    }

    /// Read a CSV file and return it with the hex SHA-256 of its raw bytes.
    pub fn read_csv_with_digest(path: impl AsRef<Path>) -> Result<(Self, String)> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| Error::io("read", "CSV file", path, e))?;
        let digest = sha256_hex(&bytes);
        let table = Self::from_reader(bytes.as_slice(), path)?;
        tracing::debug!(path = %path.display(), rows = table.len(), columns = table.headers.len(), "Loaded CSV");
        Ok((table, digest))
    }

    /// Encode as CSV: header first, `\n` line endings, quoting only where needed.
    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let csv_err = |source| Error::Csv {
            path: self.name.clone().into(),
            source,
        };

        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer.write_record(&self.headers).map_err(csv_err)?;
        for row in &self.rows {
            writer.write_record(row).map_err(csv_err)?;
        }
        writer.into_inner().map_err(|e| Error::Io {
            operation: "encode".to_string(),
            path: self.name.clone().into(),
            source: e.into_error(),
        })
    }

    /// Write the table to `path`, creating parent directories and replacing any existing file.
    ///
    /// The whole file is encoded in memory first so a failure while encoding never leaves a
    /// half-written output behind.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_csv_bytes()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("create directory", "Output directory", parent, e))?;
        }
        std::fs::write(path, bytes).map_err(|e| Error::io("write", "Output CSV", path, e))?;

        tracing::debug!(path = %path.display(), rows = self.len(), "Wrote CSV");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by exact header name.
    pub fn column(&self, name: &str) -> Result<usize> {
        self.find_column(name).ok_or_else(|| Error::MissingColumn {
            column: name.to_string(),
            table: self.name.clone(),
        })
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Cell value, `None` when the cell is null (empty).
    pub fn cell(row: &[String], column: usize) -> Option<&str> {
        row.get(column).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Drop rows whose `column` is null, then keep only the first row for each value.
    ///
    /// Returns `(dropped_null, dropped_duplicate)`.
    pub fn dedup_non_null(&mut self, column: usize) -> (usize, usize) {
        let before = self.rows.len();
        self.rows.retain(|row| Self::cell(row, column).is_some());
        let dropped_null = before - self.rows.len();

        let mut seen = std::collections::HashSet::new();
        let before = self.rows.len();
        self.rows.retain(|row| seen.insert(row[column].clone()));
        let dropped_duplicate = before - self.rows.len();

        (dropped_null, dropped_duplicate)
    }

    /// Left join against a keyed lookup.
    ///
    /// Every left row appears once per matching right row, or once padded with nulls when
    /// `key_of` yields `None` or the key has no match. Right rows must be as wide as
    /// `right_headers`.
    pub fn left_join<K, F>(&self, right_headers: &[String], right: &HashMap<K, Vec<Vec<String>>>, key_of: F) -> Result<Table>
    where
        K: Eq + Hash,
        F: Fn(usize, &[String]) -> Option<K>,
    {
        if let Some(clash) = right_headers.iter().find(|h| self.find_column(h).is_some()) {
            return Err(Error::BadInput {
                message: format!("{} already has a column named '{clash}'", self.name),
            });
        }

        let mut headers = self.headers.clone();
        headers.extend(right_headers.iter().cloned());
        let padding = vec![String::new(); right_headers.len()];

        let mut rows = Vec::with_capacity(self.rows.len());
        for (i, left) in self.rows.iter().enumerate() {
            let matches = key_of(i, left).and_then(|k| right.get(&k)).filter(|m| !m.is_empty());
            match matches {
                Some(matches) => {
                    for right_row in matches {
                        let mut row = left.clone();
                        row.extend(right_row.iter().cloned());
                        rows.push(row);
                    }
                }
                None => {
                    let mut row = left.clone();
                    row.extend(padding.iter().cloned());
                    rows.push(row);
                }
            }
        }

        Table::from_rows(self.name.clone(), headers, rows)
    }
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::table;

    #[test]
    fn test_read_treats_empty_cells_as_null() {
        let csv = "photoName,public_url\na.jpg,\nb.jpg,https://x/b.jpg\n";
        let t = Table::from_reader(csv.as_bytes(), Path::new("mem.csv")).unwrap();

        assert_eq!(t.len(), 2);
        let url = t.column("public_url").unwrap();
        assert_eq!(Table::cell(&t.rows()[0], url), None);
        assert_eq!(Table::cell(&t.rows()[1], url), Some("https://x/b.jpg"));
    }

    #[test]
    fn test_ragged_csv_is_an_error() {
        let csv = "a,b\n1,2\n3\n";
        let err = Table::from_reader(csv.as_bytes(), Path::new("ragged.csv")).unwrap_err();
        assert!(matches!(err, Error::Csv { .. }));
    }

    #[test]
    fn test_missing_column() {
        let t = table(&["a"], &[&["1"]]);
        let err = t.column("photoName").unwrap_err();
        assert!(matches!(err, Error::MissingColumn { ref column, .. } if column == "photoName"));
    }

    #[test]
    fn test_dedup_non_null_keeps_first() {
        let mut t = table(&["k", "v"], &[&["a", "1"], &["", "2"], &["a", "3"], &["b", "4"], &["", "5"]]);
        let (null, dup) = t.dedup_non_null(0);

        assert_eq!((null, dup), (2, 1));
        assert_eq!(t.rows(), &[vec!["a".to_string(), "1".to_string()], vec!["b".to_string(), "4".to_string()]]);
    }

    #[test]
    fn test_left_join_pads_and_multiplies() {
        let left = table(&["k"], &[&["a"], &["b"], &["c"]]);
        let mut right = HashMap::new();
        right.insert("a".to_string(), vec![vec!["x".to_string()]]);
        right.insert("b".to_string(), vec![vec!["y1".to_string()], vec!["y2".to_string()]]);

        let joined = left
            .left_join(&["v".to_string()], &right, |_, row| Table::cell(row, 0).map(str::to_string))
            .unwrap();

        assert_eq!(joined.headers(), &["k", "v"]);
        let flat: Vec<(String, String)> = joined.rows().iter().map(|r| (r[0].clone(), r[1].clone())).collect();
        assert_eq!(
            flat,
            vec![
                ("a".into(), "x".into()),
                ("b".into(), "y1".into()),
                ("b".into(), "y2".into()),
                ("c".into(), "".into()),
            ]
        );
    }

    #[test]
    fn test_left_join_rejects_column_clash() {
        let left = table(&["k", "v"], &[&["a", "1"]]);
        let right: HashMap<String, Vec<Vec<String>>> = HashMap::new();
        let err = left
            .left_join(&["v".to_string()], &right, |_, row| Table::cell(row, 0).map(str::to_string))
            .unwrap_err();
        assert!(matches!(err, Error::BadInput { .. }));
    }

    #[test]
    fn test_write_is_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.csv");
        let t = table(&["name", "note"], &[&["a", "has, comma"], &["b", ""]]);

        t.write_csv(&path).unwrap();
        let first = std::fs::read(&path).unwrap();
        t.write_csv(&path).unwrap();
        let second = std::fs::read(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(String::from_utf8(first).unwrap(), "name,note\na,\"has, comma\"\nb,\n");
    }

    #[test]
    fn test_digest_matches_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "a\n1\n").unwrap();

        let (t, digest) = Table::read_csv_with_digest(&path).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(digest, sha256_hex(b"a\n1\n"));
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn test_read_missing_file() {
        let err = Table::read_csv("/definitely/not/here.csv").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
