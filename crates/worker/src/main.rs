use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use shroud_comfyui::engine::ComfyUIEngine;
use shroud_worker::config::{HandlerConfig, ResolverConfig};
use shroud_worker::handler::JobHandler;
use shroud_worker::progress::JsonLinesProgress;
use shroud_worker::provision::{HuggingFaceFetcher, ModelResolver};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Secure ComfyUI job worker
#[derive(Parser)]
#[command(name = "shroud-worker", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one job. Stdout carries one JSON line per progress update,
    /// then the job result as the last line
    Handle {
        /// Job JSON (`{"id": ..., "input": {...}}` or the bare input);
        /// read from stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Link or download the models listed in MODELS
    Provision,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // Logs go to stderr; stdout carries progress lines and the job result.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shroud_worker=info,shroud_comfyui=info,shroud_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Handle { input } => handle(input).await,
        Command::Provision => provision().await,
    }
}

async fn handle(input: Option<PathBuf>) -> ExitCode {
    let config = match HandlerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let job = match read_job(input).await {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(error = %e, "Cannot read job");
            return ExitCode::FAILURE;
        }
    };
    let (job_id, job_input) = split_job(job);

    let engine = Arc::new(ComfyUIEngine::new(&config.comfyui_address));
    let handler = JobHandler::new(engine, config);

    // A signal cancels the job; the handler interrupts ComfyUI and wipes
    // the scratch directories before returning.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let progress = JsonLinesProgress::new(job_id.clone(), std::io::stdout());
    let output = handler
        .handle(job_input, &progress, &cancel)
        .instrument(tracing::info_span!("job", job_id = %job_id))
        .await;
    signal_task.abort();

    match serde_json::to_string(&output) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize job result");
            return ExitCode::FAILURE;
        }
    }
    if output.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn read_job(input: Option<PathBuf>) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let text = match input {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            text
        }
    };
    Ok(serde_json::from_str(&text)?)
}

/// Accept both the queue's `{"id", "input"}` wrapper and a bare input.
fn split_job(mut job: serde_json::Value) -> (String, serde_json::Value) {
    let id = job
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or("local")
        .to_string();
    let input = job.get_mut("input").map(serde_json::Value::take);
    match input {
        Some(input) => (id, input),
        None => (id, job),
    }
}

async fn provision() -> ExitCode {
    let config = ResolverConfig::from_env();
    let fetcher = HuggingFaceFetcher::new(config.hf_endpoint.clone(), config.hf_token.clone());
    let resolver = ModelResolver::new(config, Box::new(fetcher));

    let report = resolver.provision().await;
    tracing::info!(
        models = report.entries.len(),
        failures = report.failures(),
        "Model provisioning finished",
    );
    // Missing models surface as workflow errors later; the worker still starts.
    ExitCode::SUCCESS
}

/// Resolve on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::warn!("Received SIGINT (Ctrl-C), aborting job");
        }
        () = terminate => {
            tracing::warn!("Received SIGTERM, aborting job");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn split_job_unwraps_queue_wrapper() {
        let (id, input) = split_job(json!({ "id": "job-7", "input": { "workflow": {} } }));
        assert_eq!(id, "job-7");
        assert_eq!(input, json!({ "workflow": {} }));
    }

    #[test]
    fn split_job_accepts_bare_input() {
        let (id, input) = split_job(json!({ "encrypted": true, "payload": "x" }));
        assert_eq!(id, "local");
        assert_eq!(input, json!({ "encrypted": true, "payload": "x" }));
    }
}
