//! Single-job execution state machine.
//!
//! ```text
//! Unwrapping -> Staging -> Dispatched -> Monitoring -> Collecting -> Cleanup
//! ```
//!
//! Cleanup is owned by a [`ScratchGuard`] created before anything touches
//! the disk, so it runs on success, on every error path, and when the
//! handler future is dropped mid-flight.
//!
//! A termination request arrives through a [`CancellationToken`]. Staging
//! is never abandoned halfway: the token is checked once the inputs are
//! on disk, and again while monitoring, where it interrupts the engine
//! before the guard wipes the scratch directories.

use std::sync::Arc;

use indexmap::IndexMap;
use shroud_comfyui::engine::{EngineError, ExecutionEngine, MessageChannel};
use shroud_comfyui::history::{find_entry, HistoryEntry};
use shroud_comfyui::monitor::{wait_for_completion, MonitorError};
use shroud_core::envelope::{Envelope, OpenedEnvelope, PayloadCipher};
use shroud_core::graph::Graph;
use shroud_core::job::JobOutput;
use shroud_core::retry::retry;
use tokio_util::sync::CancellationToken;

use crate::config::HandlerConfig;
use crate::error::HandlerError;
use crate::progress::ProgressReporter;
use crate::staging::{bind_legacy_images, collect_outputs, stage_inputs, ScratchGuard};

/// One failed history lookup.
#[derive(Debug, thiserror::Error)]
enum HistoryAttempt {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("prompt not in history yet")]
    NotPresent,
    #[error("malformed history entry: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Runs jobs against one execution engine.
pub struct JobHandler {
    engine: Arc<dyn ExecutionEngine>,
    config: HandlerConfig,
}

impl JobHandler {
    pub fn new(engine: Arc<dyn ExecutionEngine>, config: HandlerConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Run one job. Never fails: every error becomes a
    /// [`JobOutput::Error`] whose message names the failure category.
    ///
    /// Cancelling `cancel` stops the job at the next safe point and still
    /// runs the secure cleanup before returning.
    pub async fn handle(
        &self,
        input: serde_json::Value,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> JobOutput {
        match self.run(input, progress, cancel).await {
            Ok(images) => {
                tracing::info!(images = images.len(), "Job succeeded");
                JobOutput::Success { images }
            }
            Err(e) => {
                tracing::error!(error = %e, "Handler error");
                JobOutput::failure(e.to_string())
            }
        }
    }

    async fn run(
        &self,
        input: serde_json::Value,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<IndexMap<String, Vec<u8>>, HandlerError> {
        // Until the envelope says otherwise, anything left behind is wiped.
        let mut guard = ScratchGuard::new(&self.config.input_dir, &self.config.output_dir);

        // -- Unwrapping --
        let OpenedEnvelope { bundle, debug } = self.open_envelope(input)?;
        guard.preserve(debug);

        // -- Staging --
        if debug {
            tracing::warn!("DEBUG MODE: skipping scratch purge and secure cleanup");
        } else {
            guard.purge();
        }
        let mut workflow = bundle.workflow;
        let staged = stage_inputs(&self.config.input_dir, bundle.images).await?;
        bind_legacy_images(&mut workflow, &staged);
        if cancel.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }

        // -- Dispatched / Monitoring / Collecting --
        let mut channel = self
            .engine
            .open_channel()
            .await
            .map_err(HandlerError::Connection)?;
        let result = self
            .execute(channel.as_mut(), &workflow, progress, cancel)
            .await;
        channel.close().await;

        let (images, paths) = result?;
        guard.track(paths);
        Ok(images)
    }

    fn open_envelope(&self, input: serde_json::Value) -> Result<OpenedEnvelope, HandlerError> {
        let envelope = Envelope::from_json(input)?;
        let cipher = if envelope.is_encrypted() {
            let secret = self
                .config
                .secret
                .as_ref()
                .ok_or(HandlerError::MissingSecret)?;
            Some(PayloadCipher::new(secret))
        } else {
            tracing::warn!("Received an unencrypted payload");
            None
        };
        Ok(envelope.open(cipher.as_ref())?)
    }

    async fn execute(
        &self,
        channel: &mut dyn MessageChannel,
        workflow: &Graph,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(IndexMap<String, Vec<u8>>, Vec<std::path::PathBuf>), HandlerError> {
        let session_id = channel.session_id().to_string();
        let prompt_id = self
            .engine
            .submit(workflow, &session_id)
            .await
            .map_err(HandlerError::Dispatch)?;
        tracing::info!(prompt_id = %prompt_id, session_id = %session_id, "Workflow dispatched");

        let monitored = tokio::select! {
            monitored = wait_for_completion(
                channel,
                &prompt_id,
                self.config.monitor_timeout,
                |step| progress.report(&step.to_string()),
            ) => monitored,
            () = cancel.cancelled() => {
                tracing::warn!(prompt_id = %prompt_id, "Job cancelled, interrupting execution");
                self.interrupt_and_settle().await;
                return Err(HandlerError::Cancelled);
            }
        };
        if let Err(e) = monitored {
            if matches!(e, MonitorError::TimedOut(_)) {
                self.interrupt_and_settle().await;
            }
            return Err(e.into());
        }

        let entry = self.fetch_history(&prompt_id).await?;
        if let Some(message) = entry.failure_message() {
            return Err(HandlerError::Application(message));
        }

        tokio::time::sleep(self.config.output_grace).await;
        Ok(collect_outputs(&self.config.output_dir, &entry.outputs).await)
    }

    /// Stop the running execution (best-effort) and give the engine the
    /// output grace period to release its last files before cleanup.
    async fn interrupt_and_settle(&self) {
        if let Err(e) = self.engine.interrupt().await {
            tracing::warn!(error = %e, "Failed to interrupt execution");
        }
        tokio::time::sleep(self.config.output_grace).await;
    }

    /// History may lag the completion message; retry within the policy.
    async fn fetch_history(&self, prompt_id: &str) -> Result<HistoryEntry, HandlerError> {
        let engine = &self.engine;
        retry(&self.config.history_retry, "History fetch", |_| async move {
            let document = engine.history(prompt_id).await?;
            find_entry(&document, prompt_id)?.ok_or(HistoryAttempt::NotPresent)
        })
        .await
        .map_err(|exhausted| HandlerError::HistoryNotReady {
            prompt_id: prompt_id.to_string(),
            attempts: exhausted.attempts,
        })
    }
}
