//! Pipeline configuration.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `config.yaml` but can be specified via `-f` flag or `STREETLENS_CONFIG`. A missing
//! file is not an error: every field has a default matching the conventional project layout
//! (`data/raw`, `data/clean`, `data/json`, `data/inferences`, `prompts/`).
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `STREETLENS_` override YAML values
//! 3. **OPENAI_API_KEY** - Special case: overrides `api.api_key` if set
//!
//! For nested values use double underscores, e.g. `STREETLENS_RECONCILER__STRATEGY=index`.
//!
//! ## Example
//!
//! ```yaml
//! api:
//!   base_url: https://api.openai.com/v1
//!   timeout: 2m
//! cleaner:
//!   crimes_path: data/raw/crimes.csv
//!   images_path: data/raw/image_urls.csv
//! builder:
//!   id_strategy: positional
//! reconciler:
//!   strategy: index
//!   results_path: data/json/batch_abc_output.jsonl
//! ```

use clap::{Parser, Subcommand};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::errors::Error;

/// Clean, submit and reconcile street-image captioning batches
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "STREETLENS_CONFIG", default_value = "config.yaml", global = true)]
    pub config: String,

    /// Validate configuration and exit without running a stage.
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Deduplicate the crime table and join it with the image URL table
    Clean,
    /// Build one vision task per image and submit them as a batch job
    Submit {
        /// Skip the interactive confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Show a batch's status and download its output file once completed
    Fetch {
        /// Batch identifier returned by `submit`
        batch_id: String,
        /// Where to write the output file (default: data/json/<batch_id>_output.jsonl)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Merge a batch output file back into the cleaned table
    Reconcile {
        /// Override the configured join strategy
        #[arg(long, value_enum)]
        strategy: Option<JoinStrategy>,
        /// Override the configured results file
        #[arg(long)]
        results: Option<PathBuf>,
        /// Submission manifest to verify the table against (index strategy)
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Remote batch API connection settings
    pub api: ApiConfig,
    /// Dataset cleaner inputs and output
    pub cleaner: CleanerConfig,
    /// Batch task builder settings
    pub builder: BuilderConfig,
    /// Result reconciler settings
    pub reconciler: ReconcilerConfig,
}

/// Batch API client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    /// Base URL including the version prefix (e.g. `https://api.openai.com/v1`)
    pub base_url: String,
    /// Bearer token; usually supplied via `OPENAI_API_KEY`
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanerConfig {
    /// Crime metadata table (primary side of the join)
    pub crimes_path: PathBuf,
    /// Image URL table (secondary side of the join)
    pub images_path: PathBuf,
    /// Cleaned output table
    pub output_path: PathBuf,
    /// Join key column in the crime table
    pub key_column: String,
    /// Path-like column in the image table the join key is derived from
    pub file_name_column: String,
    /// Public URL column carried over from the image table
    pub url_column: String,
    /// Prefix stripped from `file_name_column` to obtain the join key
    pub path_prefix: String,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            crimes_path: PathBuf::from("data/raw/crime_images.csv"),
            images_path: PathBuf::from("data/raw/image_urls.csv"),
            output_path: PathBuf::from("data/clean/crime_images_clean.csv"),
            key_column: "photoName".to_string(),
            file_name_column: "file_name".to_string(),
            url_column: "public_url".to_string(),
            path_prefix: "/content/".to_string(),
        }
    }
}

/// How each task's `custom_id` is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// The row's join key, falling back to `task-{row}` when it is null
    #[default]
    PhotoName,
    /// Always `task-{row}`
    Positional,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    /// System prompt loaded verbatim for every task
    pub prompt_path: PathBuf,
    /// Cleaned table to build tasks from
    pub input_path: PathBuf,
    /// Join key column used by the `photo_name` id strategy
    pub key_column: String,
    /// Column holding the image URL
    pub url_column: String,
    pub id_strategy: IdStrategy,
    /// Directory receiving `<batch_id>.manifest.json` after a successful submission
    pub manifest_dir: PathBuf,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            prompt_path: PathBuf::from("prompts/caption_system_prompt.txt"),
            input_path: PathBuf::from("data/clean/crime_images_clean.csv"),
            key_column: "photoName".to_string(),
            url_column: "public_url".to_string(),
            id_strategy: IdStrategy::default(),
            manifest_dir: PathBuf::from("data/inferences"),
        }
    }
}

/// How results are matched back to table rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// Numeric suffix of `custom_id` is the table row position
    Index,
    /// Echoed join key (or the `custom_id` itself) matches the key column
    #[default]
    Name,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerConfig {
    /// Batch output file (newline-delimited JSON)
    pub results_path: PathBuf,
    /// Table the batch was built from
    pub input_path: PathBuf,
    /// Annotated output table
    pub output_path: PathBuf,
    /// Join key column for the name strategy
    pub key_column: String,
    pub strategy: JoinStrategy,
    /// Add a `raw_response` column with each full result line
    pub include_raw_response: bool,
    /// Skip results whose content is not a JSON object
    pub require_json_content: bool,
    /// Submission manifest checked before an index join
    pub manifest_path: Option<PathBuf>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            results_path: PathBuf::from("data/json/batch_output.jsonl"),
            input_path: PathBuf::from("data/clean/crime_images_clean.csv"),
            output_path: PathBuf::from("data/inferences/crime_images_with_descriptions.csv"),
            key_column: "photoName".to_string(),
            strategy: JoinStrategy::default(),
            include_raw_response: true,
            require_json_content: false,
            manifest_path: None,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("STREETLENS_").ignore(&["CONFIG"]).split("__"))
            .merge(Env::raw().only(&["OPENAI_API_KEY"]).map(|_| "api.api_key".into()))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.api.base_url.trim().is_empty() {
            return Err(Error::Config {
                message: "api.base_url must not be empty".to_string(),
            });
        }
        if url::Url::parse(&self.api.base_url).is_err() {
            return Err(Error::Config {
                message: format!("api.base_url '{}' is not a valid URL", self.api.base_url),
            });
        }
        if self.api.timeout.is_zero() {
            return Err(Error::Config {
                message: "api.timeout must be greater than zero".to_string(),
            });
        }

        let columns = [
            ("cleaner.key_column", &self.cleaner.key_column),
            ("cleaner.file_name_column", &self.cleaner.file_name_column),
            ("cleaner.url_column", &self.cleaner.url_column),
            ("builder.key_column", &self.builder.key_column),
            ("builder.url_column", &self.builder.url_column),
            ("reconciler.key_column", &self.reconciler.key_column),
        ];
        if let Some((field, _)) = columns.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(Error::Config {
                message: format!("{field} must not be empty"),
            });
        }

        Ok(())
    }
}
