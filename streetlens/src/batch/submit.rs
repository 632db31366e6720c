//! Batch submission and retrieval.
//!
//! ```text
//! run_submit()
//!   ├─ load_system_prompt()        fatal if missing
//!   ├─ Table::read_csv_with_digest()
//!   ├─ build_tasks()               rows without a usable URL are skipped
//!   └─ submit()
//!        ├─ confirm(task_count)    declining ends the run normally
//!        ├─ encode_jsonl()         in memory only
//!        ├─ client.upload_file()
//!        └─ client.create_batch()
//!   └─ SubmissionManifest::write() row count + digest for the index reconciler
//! ```
//!
//! Nothing is retried. A failed upload or batch creation is returned to the caller with the
//! API's own message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::client::{BatchClient, BatchObject, CreateBatchRequest};
use super::tasks::{self, CHAT_COMPLETIONS_PATH, InferenceTask};
use crate::config::{BuilderConfig, IdStrategy};
use crate::errors::{Error, Result};
use crate::table::Table;

pub const BATCH_INPUT_FILENAME: &str = "batch_input.jsonl";
pub const FILE_PURPOSE: &str = "batch";
pub const COMPLETION_WINDOW: &str = "24h";

/// What happened to a submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Nothing to send
    NoTasks,
    /// The operator declined the confirmation
    Declined { tasks: usize },
    Submitted { file_id: String, batch_id: String, tasks: usize },
}

/// Snapshot of the table a batch was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub path: PathBuf,
    pub rows: usize,
    pub sha256: String,
}

/// Written next to the inferences after a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionManifest {
    pub batch_id: String,
    pub input_file_id: String,
    pub tasks: usize,
    pub id_strategy: IdStrategy,
    pub source: SourceSnapshot,
    pub submitted_at: DateTime<Utc>,
}

impl SubmissionManifest {
    pub fn file_name(batch_id: &str) -> String {
        format!("{batch_id}.manifest.json")
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).map_err(|e| Error::io("create directory", "Manifest directory", dir, e))?;
        let path = dir.join(Self::file_name(&self.batch_id));
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| Error::io("write", "Manifest", &path, e))?;
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::io("read", "Manifest", path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Confirm, encode and submit `tasks` as one batch job.
///
/// `confirm` receives the task count and decides whether to spend money on the batch.
pub async fn submit<C, F>(
    client: &C,
    tasks: &[InferenceTask],
    system_prompt: &str,
    source: Option<&SourceSnapshot>,
    confirm: F,
) -> Result<SubmitOutcome>
where
    C: BatchClient + ?Sized,
    F: FnOnce(usize) -> bool,
{
    if tasks.is_empty() {
        tracing::info!("No tasks generated, nothing to submit");
        return Ok(SubmitOutcome::NoTasks);
    }

    if !confirm(tasks.len()) {
        tracing::info!(tasks = tasks.len(), "Submission cancelled by operator");
        return Ok(SubmitOutcome::Declined { tasks: tasks.len() });
    }

    let payload = tasks::encode_jsonl(tasks, system_prompt)?;
    tracing::info!(tasks = tasks.len(), bytes = payload.len(), "Uploading batch input file");
    let file = client.upload_file(BATCH_INPUT_FILENAME, payload, FILE_PURPOSE).await?;
    tracing::info!(file_id = %file.id, "Batch input file uploaded");

    let metadata = source.map(|s| {
        HashMap::from([
            ("source_rows".to_string(), s.rows.to_string()),
            ("source_sha256".to_string(), s.sha256.clone()),
        ])
    });
    let request = CreateBatchRequest {
        input_file_id: file.id.clone(),
        endpoint: CHAT_COMPLETIONS_PATH.to_string(),
        completion_window: COMPLETION_WINDOW.to_string(),
        metadata,
    };
    let batch = client.create_batch(&request).await?;
    tracing::info!(batch_id = %batch.id, status = %batch.status, "Batch job created");

    Ok(SubmitOutcome::Submitted {
        file_id: file.id,
        batch_id: batch.id,
        tasks: tasks.len(),
    })
}

/// Full builder stage: prompt, table, tasks, confirmation, submission, manifest.
pub async fn run_submit<C, F>(client: &C, config: &BuilderConfig, confirm: F) -> Result<SubmitOutcome>
where
    C: BatchClient + ?Sized,
    F: FnOnce(usize) -> bool,
{
    let system_prompt = tasks::load_system_prompt(&config.prompt_path)?;
    let (table, sha256) = Table::read_csv_with_digest(&config.input_path)?;
    tracing::info!(path = %config.input_path.display(), rows = table.len(), "Loaded cleaned table");

    let tasks = tasks::build_tasks(&table, config)?;
    let source = SourceSnapshot {
        path: config.input_path.clone(),
        rows: table.len(),
        sha256,
    };

    let outcome = submit(client, &tasks, &system_prompt, Some(&source), confirm).await?;

    if let SubmitOutcome::Submitted { file_id, batch_id, tasks } = &outcome {
        let manifest = SubmissionManifest {
            batch_id: batch_id.clone(),
            input_file_id: file_id.clone(),
            tasks: *tasks,
            id_strategy: config.id_strategy,
            source,
            submitted_at: Utc::now(),
        };
        // The batch already exists remotely; a manifest failure must not hide its id.
        match manifest.write(&config.manifest_dir) {
            Ok(path) => tracing::info!(path = %path.display(), "Submission manifest written"),
            Err(e) => tracing::warn!(batch_id = %batch_id, error = %e, "Failed to write submission manifest"),
        }
    }

    Ok(outcome)
}

/// Result of looking up a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The batch has not completed; nothing was written
    Pending { status: String },
    /// Completed but the service produced no output file
    NoOutput,
    Downloaded { path: PathBuf, bytes: usize },
}

pub fn default_output_path(batch_id: &str) -> PathBuf {
    PathBuf::from("data/json").join(format!("{batch_id}_output.jsonl"))
}

/// Look up a batch and download its output file if it has completed.
pub async fn fetch<C>(client: &C, batch_id: &str, output: &Path) -> Result<FetchOutcome>
where
    C: BatchClient + ?Sized,
{
    let batch: BatchObject = client.retrieve_batch(batch_id).await?;
    let counts = batch.request_counts.clone().unwrap_or_default();
    tracing::info!(
        batch_id = %batch.id,
        status = %batch.status,
        total = counts.total,
        completed = counts.completed,
        failed = counts.failed,
        "Batch status"
    );

    if !batch.is_completed() {
        return Ok(FetchOutcome::Pending { status: batch.status });
    }

    let Some(output_file_id) = batch.output_file_id.as_deref() else {
        tracing::warn!(batch_id = %batch.id, error_file_id = ?batch.error_file_id, "Batch completed without an output file");
        return Ok(FetchOutcome::NoOutput);
    };

    let content = client.file_content(output_file_id).await?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::io("create directory", "Output directory", parent, e))?;
    }
    std::fs::write(output, &content).map_err(|e| Error::io("write", "Batch output file", output, e))?;
    tracing::info!(path = %output.display(), bytes = content.len(), "Batch output downloaded");

    Ok(FetchOutcome::Downloaded {
        path: output.to_path_buf(),
        bytes: content.len(),
    })
}
