use clap::{CommandFactory, Parser};
use dialoguer::Confirm;
use std::process::ExitCode;
use streetlens::batch::{FetchOutcome, OpenAiClient, SubmitOutcome, fetch, run_submit, submit::default_output_path};
use streetlens::config::{Args, Command};
use streetlens::{Config, Error, cleaner, reconcile, telemetry};

/// Ask the operator before anything that costs money is sent.
fn confirm_submission(tasks: usize) -> bool {
    Confirm::new()
        .with_prompt(format!("{tasks} tasks generated. Submit the batch?"))
        .default(false)
        .interact()
        .unwrap_or(false)
}

async fn run(command: Command, mut config: Config) -> Result<(), Error> {
    match command {
        Command::Clean => {
            cleaner::run(&config.cleaner)?;
        }
        Command::Submit { yes } => {
            let client = OpenAiClient::new(&config.api)?;
            let confirm = |tasks: usize| yes || confirm_submission(tasks);
            match run_submit(&client, &config.builder, confirm).await? {
                SubmitOutcome::Submitted { batch_id, file_id, tasks } => {
                    tracing::info!(batch_id = %batch_id, file_id = %file_id, tasks, "Batch submitted; run `fetch {batch_id}` later");
                }
                SubmitOutcome::Declined { .. } => tracing::info!("Nothing was submitted"),
                SubmitOutcome::NoTasks => tracing::info!("No rows with a usable image URL"),
            }
        }
        Command::Fetch { batch_id, output } => {
            let client = OpenAiClient::new(&config.api)?;
            let output = output.unwrap_or_else(|| default_output_path(&batch_id));
            match fetch(&client, &batch_id, &output).await? {
                FetchOutcome::Pending { status } => tracing::info!(status = %status, "Batch has not completed yet"),
                FetchOutcome::NoOutput => tracing::warn!("Batch completed without output; check its error file"),
                FetchOutcome::Downloaded { path, .. } => {
                    tracing::info!(path = %path.display(), "Run `reconcile --results {}` next", path.display())
                }
            }
        }
        Command::Reconcile {
            strategy,
            results,
            manifest,
        } => {
            if let Some(strategy) = strategy {
                config.reconciler.strategy = strategy;
            }
            if let Some(results) = results {
                config.reconciler.results_path = results;
            }
            if manifest.is_some() {
                config.reconciler.manifest_path = manifest;
            }
            reconcile::run(&config.reconciler)?;
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if args.validate {
        println!("Configuration is valid.");
        return ExitCode::SUCCESS;
    }

    if let Err(e) = telemetry::init_telemetry() {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let Some(command) = args.command else {
        let _ = Args::command().print_help();
        return ExitCode::FAILURE;
    };

    match run(command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
