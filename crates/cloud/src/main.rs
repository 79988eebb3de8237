use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use shroud_cloud::config::ClientConfig;
use shroud_cloud::queue::JobQueueClient;
use shroud_cloud::submit::{load_workflow, run_submission, SubmissionOutcome, SubmitRequest};
use shroud_core::config::SafetyToggles;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Submit a ComfyUI workflow to the secure job queue and wait for results.
#[derive(Parser)]
#[command(name = "shroud-submit", version, about, long_about = None)]
struct Cli {
    /// API-format workflow JSON file
    #[arg(long, default_value = "workflow_api.json")]
    workflow: PathBuf,

    /// Input image; repeat to bind several LoadImage nodes in ID order
    #[arg(long = "img")]
    images: Vec<PathBuf>,

    /// Prompt text for the workflow's text-encoder nodes
    #[arg(long)]
    prompt: Option<String>,

    /// Seconds between status checks (overrides POLL_INTERVAL_SECS)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Send the payload unencrypted and keep worker scratch files.
    /// Troubleshooting only; never use with sensitive inputs.
    #[arg(long)]
    debug: bool,

    /// Directory for returned images
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shroud_cloud=info,shroud_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(secs) = cli.poll_interval {
        config.poll_interval = Duration::from_secs(secs);
    }
    config.output_dir = cli.output_dir;

    let workflow = match load_workflow(&cli.workflow).await {
        Ok(workflow) => workflow,
        Err(e) => {
            tracing::error!(error = %e, "Cannot load workflow");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let queue = JobQueueClient::new(config.endpoint_url.clone(), config.api_key.clone());
    let request = SubmitRequest {
        workflow,
        image_paths: cli.images,
        prompt: cli.prompt,
        toggles: SafetyToggles::from_debug(cli.debug),
    };

    match run_submission(&queue, &config, request, &cancel).await {
        Ok(SubmissionOutcome::Saved { job_id, files }) => {
            tracing::info!(job_id = %job_id, saved = files.len(), "Done");
            ExitCode::SUCCESS
        }
        Ok(SubmissionOutcome::Interrupted { job_id }) => {
            tracing::info!(job_id = %job_id, "To check later, use this job ID");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Job failed");
            ExitCode::FAILURE
        }
    }
}
