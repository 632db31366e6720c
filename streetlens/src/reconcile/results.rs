//! Batch output parsing.
//!
//! Every line of a batch output file is an independent JSON object. A line contributes a
//! [`BatchResult`] when it has a string `custom_id`, a successful response and a string
//! `response.body.choices[0].message.content`. Anything else is skipped with a warning and
//! counted in the [`ParseReport`].

use serde::Deserialize;
use serde_json::Value;
use std::io::BufRead;
use std::path::Path;

use crate::errors::{Error, Result};

/// One usable line from a batch output file.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub custom_id: String,
    /// Integer after the last `-` in `custom_id`, when there is one
    pub index: Option<usize>,
    /// Join key echoed back in the line's `input` object, when present
    pub echoed_key: Option<String>,
    pub result_text: String,
    /// The full line, kept for diagnostics
    pub raw_response: Value,
}

/// Line accounting for one parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseReport {
    pub lines: usize,
    pub parsed: usize,
    pub invalid_json: usize,
    pub missing_fields: usize,
    pub failed_requests: usize,
    pub non_json_content: usize,
}

impl ParseReport {
    pub fn skipped(&self) -> usize {
        self.invalid_json + self.missing_fields + self.failed_requests + self.non_json_content
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions<'a> {
    /// Column name looked up in a line's `input` object
    pub key_column: Option<&'a str>,
    /// Skip results whose content is not a JSON object
    pub require_json_content: bool,
}

#[derive(Deserialize)]
struct ResultLine {
    custom_id: Option<String>,
    response: Option<ResponseEnvelope>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    status_code: Option<u16>,
    body: Option<Value>,
}

/// Integer suffix of a task id: `task-123` -> `123`.
pub fn index_from_custom_id(custom_id: &str) -> Option<usize> {
    let suffix = custom_id.rsplit('-').next()?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

fn extract_content(body: &Value) -> Option<&str> {
    body.get("choices")?.get(0)?.get("message")?.get("content")?.as_str()
}

fn echoed_key(line: &Value, key_column: &str) -> Option<String> {
    match line.get("input")?.get(key_column)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse newline-delimited JSON results from any buffered reader.
///
/// Only I/O failures are errors; malformed lines (including invalid UTF-8) are skipped.
pub fn parse_results<R: BufRead>(reader: R, options: ParseOptions<'_>) -> std::io::Result<(Vec<BatchResult>, ParseReport)> {
    let mut results = Vec::new();
    let mut report = ParseReport::default();

    for (i, line) in reader.split(b'\n').enumerate() {
        let line = line?;
        let line_number = i + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        report.lines += 1;

        let trimmed = match std::str::from_utf8(&line) {
            Ok(text) => text.trim(),
            Err(e) => {
                tracing::warn!(line_number, error = %e, "Skipping line that is not valid UTF-8");
                report.invalid_json += 1;
                continue;
            }
        };

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(line_number, error = %e, "Skipping line that is not valid JSON");
                report.invalid_json += 1;
                continue;
            }
        };

        let parsed: ResultLine = match serde_json::from_value(value.clone()) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(line_number, error = %e, "Skipping line with unexpected structure");
                report.missing_fields += 1;
                continue;
            }
        };

        let Some(custom_id) = parsed.custom_id else {
            tracing::warn!(line_number, "Skipping line without custom_id");
            report.missing_fields += 1;
            continue;
        };

        if parsed.error.as_ref().is_some_and(|e| !e.is_null()) {
            tracing::warn!(line_number, custom_id = %custom_id, error = %parsed.error.unwrap_or_default(), "Skipping failed request");
            report.failed_requests += 1;
            continue;
        }

        let Some(response) = parsed.response else {
            tracing::warn!(line_number, custom_id = %custom_id, "Skipping line without response");
            report.missing_fields += 1;
            continue;
        };

        if let Some(status) = response.status_code.filter(|s| !(200..300).contains(s)) {
            tracing::warn!(line_number, custom_id = %custom_id, status, "Skipping failed request");
            report.failed_requests += 1;
            continue;
        }

        let Some(content) = response.body.as_ref().and_then(extract_content) else {
            tracing::warn!(line_number, custom_id = %custom_id, "Skipping line without response.body.choices[0].message.content");
            report.missing_fields += 1;
            continue;
        };

        if !matches!(serde_json::from_str::<Value>(content), Ok(Value::Object(_))) {
            if options.require_json_content {
                tracing::warn!(line_number, custom_id = %custom_id, "Skipping result whose content is not a JSON object");
                report.non_json_content += 1;
                continue;
            }
            tracing::debug!(line_number, custom_id = %custom_id, "Result content is not a JSON object, keeping as text");
        }

        results.push(BatchResult {
            index: index_from_custom_id(&custom_id),
            echoed_key: options.key_column.and_then(|k| echoed_key(&value, k)),
            result_text: content.to_string(),
            custom_id,
            raw_response: value,
        });
        report.parsed += 1;
    }

    Ok((results, report))
}

/// Parse a results file. A missing file is [`Error::NotFound`]; an empty parse is
/// [`Error::EmptyResults`].
pub fn read_results(path: &Path, options: ParseOptions<'_>) -> Result<(Vec<BatchResult>, ParseReport)> {
    tracing::info!(path = %path.display(), "Processing results file");
    let file = std::fs::File::open(path).map_err(|e| Error::io("open", "Results file", path, e))?;
    let (results, report) =
        parse_results(std::io::BufReader::new(file), options).map_err(|e| Error::io("read", "Results file", path, e))?;

    tracing::info!(
        lines = report.lines,
        parsed = report.parsed,
        skipped = report.skipped(),
        invalid_json = report.invalid_json,
        missing_fields = report.missing_fields,
        failed_requests = report.failed_requests,
        non_json_content = report.non_json_content,
        "Results parsed"
    );

    if results.is_empty() {
        return Err(Error::EmptyResults { path: path.to_path_buf() });
    }
    Ok((results, report))
}
