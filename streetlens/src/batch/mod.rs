//! Batch task builder and remote batch API access.

pub mod client;
pub mod submit;
pub mod tasks;

pub use client::{BatchClient, BatchObject, CreateBatchRequest, FileObject, OpenAiClient};
pub use submit::{FetchOutcome, SubmissionManifest, SubmitOutcome, fetch, run_submit, submit};
pub use tasks::{InferenceTask, build_tasks, encode_jsonl};
