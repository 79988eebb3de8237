//! Status polling loop.

use std::time::Duration;

use shroud_core::retry::retry_forever;
use tokio_util::sync::CancellationToken;

use crate::queue::{JobQueue, JobStatus, StatusResponse};

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Sleep between status checks while the job is not terminal.
    pub interval: Duration,
    /// Sleep after a failed status request before trying again.
    pub transient_backoff: Duration,
}

#[derive(Debug)]
pub enum PollOutcome {
    /// The job reached `Completed`, `Failed` or `Cancelled`.
    Terminal(StatusResponse),
    /// The operator stopped observing. The remote job keeps running.
    Interrupted,
}

/// Poll `job_id` until it reaches a terminal status or `cancel` fires.
///
/// Status transitions and progress are logged. Request failures never end
/// the loop; they are retried after `transient_backoff`, indefinitely.
pub async fn poll_until_terminal(
    queue: &dyn JobQueue,
    job_id: &str,
    settings: &PollSettings,
    cancel: &CancellationToken,
) -> PollOutcome {
    let mut last_status: Option<JobStatus> = None;

    loop {
        let fetch = retry_forever(settings.transient_backoff, "Status poll", |_| {
            queue.status(job_id)
        });
        let response = tokio::select! {
            _ = cancel.cancelled() => return interrupted(job_id),
            response = fetch => response,
        };

        if last_status.as_ref() != Some(&response.status) {
            tracing::info!(job_id, status = %response.status, "Job status changed");
            last_status = Some(response.status.clone());
        }
        if let Some(progress) = response.progress_text() {
            tracing::info!(job_id, progress = %progress, "Job progress");
        }

        if response.status.is_terminal() {
            return PollOutcome::Terminal(response);
        }

        tokio::select! {
            _ = cancel.cancelled() => return interrupted(job_id),
            _ = tokio::time::sleep(settings.interval) => {}
        }
    }
}

fn interrupted(job_id: &str) -> PollOutcome {
    tracing::warn!(
        job_id,
        "Polling interrupted. The job is still running on the server",
    );
    PollOutcome::Interrupted
}
