//! Test fixtures shared by the unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::batch::client::{BatchClient, BatchObject, CreateBatchRequest, FileObject, RequestCounts};
use crate::errors::{Error, Result};
use crate::table::Table;

/// Build a table from string literals.
pub fn table(headers: &[&str], rows: &[&[&str]]) -> Table {
    Table::from_rows(
        "fixture",
        headers.iter().map(|h| h.to_string()).collect(),
        rows.iter().map(|r| r.iter().map(|c| c.to_string()).collect()).collect(),
    )
    .expect("fixture rows must match the header width")
}

/// One upload seen by [`MockBatchClient`].
#[derive(Debug, Clone)]
pub struct UploadCall {
    pub filename: String,
    pub purpose: String,
    pub content: Vec<u8>,
}

/// In-memory [`BatchClient`] recording every call.
///
/// Uploads return `file-1`, batch creation returns `batch-1`, and `retrieve_batch` reports the
/// status configured with [`MockBatchClient::with_batch_status`].
#[derive(Default)]
pub struct MockBatchClient {
    uploads: Mutex<Vec<UploadCall>>,
    batch_requests: Mutex<Vec<CreateBatchRequest>>,
    upload_error: Mutex<Option<Error>>,
    batch_status: Option<(String, Option<String>)>,
    files: HashMap<String, Vec<u8>>,
}

impl MockBatchClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next upload fails with `error`.
    pub fn failing_upload(self, error: Error) -> Self {
        *self.upload_error.lock().unwrap() = Some(error);
        self
    }

    pub fn with_batch_status(mut self, status: &str, output_file_id: Option<&str>) -> Self {
        self.batch_status = Some((status.to_string(), output_file_id.map(str::to_string)));
        self
    }

    pub fn with_file_content(mut self, file_id: &str, content: &[u8]) -> Self {
        self.files.insert(file_id.to_string(), content.to_vec());
        self
    }

    pub fn uploads(&self) -> Vec<UploadCall> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn batch_requests(&self) -> Vec<CreateBatchRequest> {
        self.batch_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchClient for MockBatchClient {
    async fn upload_file(&self, filename: &str, content: Vec<u8>, purpose: &str) -> Result<FileObject> {
        if let Some(error) = self.upload_error.lock().unwrap().take() {
            return Err(error);
        }
        let bytes = content.len() as i64;
        self.uploads.lock().unwrap().push(UploadCall {
            filename: filename.to_string(),
            purpose: purpose.to_string(),
            content,
        });
        Ok(FileObject {
            id: "file-1".to_string(),
            bytes,
            created_at: 0,
            filename: Some(filename.to_string()),
            purpose: purpose.to_string(),
        })
    }

    async fn create_batch(&self, request: &CreateBatchRequest) -> Result<BatchObject> {
        self.batch_requests.lock().unwrap().push(request.clone());
        Ok(BatchObject {
            id: "batch-1".to_string(),
            status: "validating".to_string(),
            endpoint: request.endpoint.clone(),
            input_file_id: request.input_file_id.clone(),
            completion_window: request.completion_window.clone(),
            output_file_id: None,
            error_file_id: None,
            created_at: 0,
            request_counts: Some(RequestCounts::default()),
            metadata: request.metadata.clone(),
        })
    }

    async fn retrieve_batch(&self, batch_id: &str) -> Result<BatchObject> {
        let Some((status, output_file_id)) = self.batch_status.clone() else {
            return Err(Error::Api {
                status: 404,
                message: format!("No batch found with id '{batch_id}'."),
            });
        };
        Ok(BatchObject {
            id: batch_id.to_string(),
            status,
            endpoint: "/v1/chat/completions".to_string(),
            input_file_id: "file-1".to_string(),
            completion_window: "24h".to_string(),
            output_file_id,
            error_file_id: None,
            created_at: 0,
            request_counts: Some(RequestCounts {
                total: 1,
                completed: 1,
                failed: 0,
            }),
            metadata: None,
        })
    }

    async fn file_content(&self, file_id: &str) -> Result<Vec<u8>> {
        self.files.get(file_id).cloned().ok_or_else(|| Error::Api {
            status: 404,
            message: format!("No such File object: {file_id}"),
        })
    }
}

/// A well-formed result line as produced by the batch service.
pub fn result_line(custom_id: &str, content: &str) -> String {
    serde_json::json!({
        "id": format!("batch_req_{custom_id}"),
        "custom_id": custom_id,
        "response": {
            "status_code": 200,
            "request_id": "req_1",
            "body": {
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "model": "gpt-4o-mini",
                "choices": [
                    {"index": 0, "message": {"role": "assistant", "content": content}, "finish_reason": "stop"}
                ]
            }
        },
        "error": null
    })
    .to_string()
}
