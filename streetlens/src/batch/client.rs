//! Batch API client abstraction.
//!
//! The [`BatchClient`] trait covers the four calls the pipeline makes against an
//! OpenAI-compatible files/batches API. [`OpenAiClient`] is the production implementation;
//! it is built explicitly from [`ApiConfig`] and handed to the operations that need it, so
//! tests can pass a fake instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ApiConfig;
use crate::errors::{Error, Result};

/// File object returned by the upload endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileObject {
    pub id: String,
    #[serde(default)]
    pub bytes: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub purpose: String,
}

/// Request body for creating a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBatchRequest {
    /// The ID of an uploaded file that contains requests for the new batch
    pub input_file_id: String,

    /// The endpoint to be used for all requests in the batch
    pub endpoint: String,

    /// The time frame within which the batch should be processed
    pub completion_window: String,

    /// Optional metadata (up to 16 key-value pairs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

/// Request counts for a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Batch object (the subset of fields the pipeline reads)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchObject {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub input_file_id: String,
    #[serde(default)]
    pub completion_window: String,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub request_counts: Option<RequestCounts>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl BatchObject {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

/// Operations against a remote batch inference service.
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Upload an in-memory file.
    async fn upload_file(&self, filename: &str, content: Vec<u8>, purpose: &str) -> Result<FileObject>;

    /// Create a batch job over a previously uploaded file.
    async fn create_batch(&self, request: &CreateBatchRequest) -> Result<BatchObject>;

    /// Fetch the current state of a batch job.
    async fn retrieve_batch(&self, batch_id: &str) -> Result<BatchObject>;

    /// Download a file's raw content.
    async fn file_content(&self, file_id: &str) -> Result<Vec<u8>>;
}

/// Production client using reqwest.
#[derive(Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        if config.api_key.is_none() {
            tracing::warn!("No API key configured; requests will be sent without Authorization");
        }
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Turn a non-2xx response into [`Error::Api`], preferring the API's own error message.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or(body);

        tracing::error!(status = status.as_u16(), message = %message, "Batch API request failed");
        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl BatchClient for OpenAiClient {
    #[tracing::instrument(skip(self, content), fields(bytes = content.len()))]
    async fn upload_file(&self, filename: &str, content: Vec<u8>, purpose: &str) -> Result<FileObject> {
        let part = reqwest::multipart::Part::bytes(content)
            .file_name(filename.to_string())
            .mime_str("application/jsonl")?;
        let form = reqwest::multipart::Form::new().text("purpose", purpose.to_string()).part("file", part);

        let response = self
            .authorize(self.client.post(self.url("/files")))
            .multipart(form)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    #[tracing::instrument(skip(self, request), fields(input_file_id = %request.input_file_id))]
    async fn create_batch(&self, request: &CreateBatchRequest) -> Result<BatchObject> {
        let response = self
            .authorize(self.client.post(self.url("/batches")))
            .json(request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    #[tracing::instrument(skip(self))]
    async fn retrieve_batch(&self, batch_id: &str) -> Result<BatchObject> {
        let response = self
            .authorize(self.client.get(self.url(&format!("/batches/{batch_id}"))))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    #[tracing::instrument(skip(self))]
    async fn file_content(&self, file_id: &str) -> Result<Vec<u8>> {
        let response = self
            .authorize(self.client.get(self.url(&format!("/files/{file_id}/content"))))
            .send()
            .await?;
        Ok(Self::check(response).await?.bytes().await?.to_vec())
    }
}
