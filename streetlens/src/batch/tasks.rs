//! Inference task generation.
//!
//! One chat-completions request per table row with a usable image URL. Every request shares the
//! same system prompt, user instruction and model parameters; only the `custom_id` and the image
//! URL vary.

use std::collections::HashMap;
use std::path::Path;

use crate::config::{BuilderConfig, IdStrategy};
use crate::errors::{Error, Result};
use crate::table::Table;

/// Model used for every task.
pub const MODEL: &str = "gpt-4o-mini";
pub const TEMPERATURE: f64 = 0.2;
pub const MAX_TOKENS: u32 = 500;
/// Endpoint every request line targets; also the batch job's endpoint.
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
/// Low detail keeps image token usage down.
pub const IMAGE_DETAIL: &str = "low";
pub const USER_INSTRUCTION: &str =
    "Analyze the following street image and describe the relevant elements according to your instructions.";

/// A single request destined for the batch payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceTask {
    pub custom_id: String,
    /// Position of the source row in the table
    pub row: usize,
    pub image_url: String,
}

impl InferenceTask {
    /// The newline-delimited JSON request object for this task.
    pub fn request_line(&self, system_prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "custom_id": self.custom_id,
            "method": "POST",
            "url": CHAT_COMPLETIONS_PATH,
            "body": {
                "model": MODEL,
                "temperature": TEMPERATURE,
                "max_tokens": MAX_TOKENS,
                "response_format": {"type": "json_object"},
                "messages": [
                    {"role": "system", "content": system_prompt},
                    {
                        "role": "user",
                        "content": [
                            {
                                "type": "text",
                                "text": USER_INSTRUCTION
                            },
                            {
                                "type": "image_url",
                                "image_url": {
                                    "url": self.image_url,
                                    "detail": IMAGE_DETAIL
                                }
                            }
                        ]
                    }
                ]
            }
        })
    }
}

/// Positional id for row `row`; the reconciler's index strategy parses the suffix back.
pub fn positional_id(row: usize) -> String {
    format!("task-{row}")
}

/// Load the system prompt verbatim.
pub fn load_system_prompt(path: &Path) -> Result<String> {
    let prompt = std::fs::read_to_string(path).map_err(|e| Error::io("read", "System prompt", path, e))?;
    if prompt.trim().is_empty() {
        tracing::warn!(path = %path.display(), "System prompt is empty");
    }
    tracing::info!(path = %path.display(), chars = prompt.chars().count(), "System prompt loaded");
    Ok(prompt)
}

/// Returns the trimmed URL if it is an absolute http(s) URL.
pub fn usable_image_url(raw: Option<&str>) -> Option<&str> {
    let candidate = raw?.trim();
    if candidate.is_empty() {
        return None;
    }
    match url::Url::parse(candidate) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(candidate),
        _ => None,
    }
}

/// Generate one task per row with a usable image URL.
///
/// Rows without one are skipped with a warning. Two rows resolving to the same `custom_id`
/// abort the build, since their results could not be told apart afterwards.
pub fn build_tasks(table: &Table, config: &BuilderConfig) -> Result<Vec<InferenceTask>> {
    let url_column = table.column(&config.url_column)?;
    let key_column = match config.id_strategy {
        IdStrategy::PhotoName => {
            let column = table.find_column(&config.key_column);
            if column.is_none() {
                tracing::warn!(
                    column = %config.key_column,
                    "Key column not found, falling back to positional task ids"
                );
            }
            column
        }
        IdStrategy::Positional => None,
    };

    let mut tasks = Vec::with_capacity(table.len());
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (row_index, row) in table.rows().iter().enumerate() {
        let Some(image_url) = usable_image_url(Table::cell(row, url_column)) else {
            tracing::warn!(row = row_index, "Row has no usable image URL, skipping");
            continue;
        };

        let custom_id = key_column
            .and_then(|c| Table::cell(row, c))
            .map(str::to_string)
            .unwrap_or_else(|| positional_id(row_index));

        if let Some(&first_row) = seen.get(&custom_id) {
            return Err(Error::DuplicateCustomId {
                custom_id,
                first_row,
                second_row: row_index,
            });
        }
        seen.insert(custom_id.clone(), row_index);

        tasks.push(InferenceTask {
            custom_id,
            row: row_index,
            image_url: image_url.to_string(),
        });
    }

    tracing::info!(tasks = tasks.len(), rows = table.len(), "Task generation complete");
    Ok(tasks)
}

/// Serialize tasks as newline-delimited JSON, entirely in memory.
pub fn encode_jsonl(tasks: &[InferenceTask], system_prompt: &str) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for task in tasks {
        serde_json::to_writer(&mut payload, &task.request_line(system_prompt))?;
        payload.push(b'\n');
    }
    Ok(payload)
}
