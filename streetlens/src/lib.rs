//! # streetlens: street-crime image captioning pipeline
//!
//! `streetlens` turns a table of street-crime records into vision-model descriptions of the
//! photographs attached to them. The work is split into three stages that communicate only
//! through files on disk and are run one after another by an operator:
//!
//! 1. **Clean** ([`cleaner`]): deduplicate the crime table on its `photoName` join key and
//!    left-join it with the table of public image URLs.
//! 2. **Submit** ([`batch`]): build one chat-completions request per image, encode them as
//!    newline-delimited JSON in memory, and after an explicit confirmation upload them as a
//!    batch job to an OpenAI-compatible API. `fetch` later downloads the job's output file.
//! 3. **Reconcile** ([`reconcile`]): parse the job's output file and merge each description
//!    back onto its source row, by row position or by join key.
//!
//! ## Quick Start
//!
//! ```no_run
//! use streetlens::batch::{OpenAiClient, SubmitOutcome, run_submit};
//! use streetlens::config::Config;
//!
//! # async fn example(config: Config) -> Result<(), streetlens::errors::Error> {
//! streetlens::cleaner::run(&config.cleaner)?;
//!
//! let client = OpenAiClient::new(&config.api)?;
//! match run_submit(&client, &config.builder, |tasks| tasks < 10_000).await? {
//!     SubmitOutcome::Submitted { batch_id, .. } => println!("submitted {batch_id}"),
//!     other => println!("nothing submitted: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod batch;
pub mod cleaner;
pub mod config;
pub mod errors;
pub mod reconcile;
pub mod table;
pub mod telemetry;

#[cfg(test)]
mod test_utils;

pub use config::Config;
pub use errors::{Error, Result};
