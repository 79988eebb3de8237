//! The submission pipeline: load, inject, seal, submit, poll, save.

use std::path::{Path, PathBuf};

use shroud_core::config::SafetyToggles;
use shroud_core::envelope::{Envelope, EnvelopeError, PayloadCipher};
use shroud_core::error::CoreError;
use shroud_core::graph::Graph;
use shroud_core::injection::{inject, ImageInput, InjectionReport, OverrideSet, SeedPolicy};
use shroud_core::job::JobOutput;
use tokio_util::sync::CancellationToken;

use crate::artifacts::save_artifacts;
use crate::config::ClientConfig;
use crate::poll::{poll_until_terminal, PollOutcome, PollSettings};
use crate::queue::{JobQueue, JobStatus, QueueError, StatusResponse};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid workflow: {0}")]
    Workflow(#[from] CoreError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("Submission failed: {0}")]
    Queue(#[from] QueueError),

    /// Transport-level failure reported by the queue.
    #[error("Job {job_id} {status}: {error}")]
    JobFailed {
        job_id: String,
        status: JobStatus,
        error: String,
    },

    /// The worker ran the job and reported an error in its output.
    #[error("Worker error for job {job_id}: {message}")]
    Application { job_id: String, message: String },

    #[error("Job {job_id} completed without a readable output: {reason}")]
    InvalidOutput { job_id: String, reason: String },
}

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// Everything the operator asked for.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub workflow: Graph,
    /// Images in binding order.
    pub image_paths: Vec<PathBuf>,
    pub prompt: Option<String>,
    pub toggles: SafetyToggles,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Completed successfully; artifacts were written to these paths.
    Saved { job_id: String, files: Vec<PathBuf> },
    /// Polling was stopped; the job may still be running remotely.
    Interrupted { job_id: String },
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Read and parse an API-format workflow file.
pub async fn load_workflow(path: &Path) -> Result<Graph, SubmitError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SubmitError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        CoreError::Validation(format!("{} is not valid JSON: {e}", path.display()))
    })?;
    Ok(Graph::from_json(&json)?)
}

/// Read each image; the remote filename is the local basename.
pub async fn load_images(paths: &[PathBuf]) -> Result<Vec<ImageInput>, SubmitError> {
    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                CoreError::Validation(format!("{} has no usable file name", path.display()))
            })?
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| SubmitError::Read {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(filename = %filename, bytes = bytes.len(), "Loaded input image");
        images.push(ImageInput { filename, bytes });
    }
    Ok(images)
}

/// Bind overrides into `workflow` and wrap the result for transport.
pub fn prepare_envelope(
    workflow: Graph,
    images: Vec<ImageInput>,
    prompt: Option<String>,
    toggles: SafetyToggles,
    cipher: Option<&PayloadCipher>,
) -> Result<(Envelope, InjectionReport), SubmitError> {
    let overrides = OverrideSet {
        images,
        prompt,
        seed_policy: SeedPolicy::RandomizeIfPresent,
    };
    let (bundle, report) = inject(workflow, overrides);
    let envelope = Envelope::build(bundle, toggles, cipher)?;
    if !envelope.is_encrypted() {
        tracing::warn!("Payload is NOT encrypted (debug mode)");
    }
    Ok((envelope, report))
}

/// Run the whole submission for `request`.
///
/// Submission is attempted once. Polling survives transient errors and
/// ends on a terminal status or when `cancel` fires.
pub async fn run_submission(
    queue: &dyn JobQueue,
    config: &ClientConfig,
    request: SubmitRequest,
    cancel: &CancellationToken,
) -> Result<SubmissionOutcome, SubmitError> {
    let images = load_images(&request.image_paths).await?;
    let cipher = config.secret.as_ref().map(PayloadCipher::new);
    let (envelope, _report) = prepare_envelope(
        request.workflow,
        images,
        request.prompt,
        request.toggles,
        cipher.as_ref(),
    )?;

    let job_id = queue.submit(&envelope).await?;
    drop(envelope);
    tracing::info!(job_id = %job_id, "Job submitted");

    let settings = PollSettings {
        interval: config.poll_interval,
        transient_backoff: config.transient_backoff,
    };
    match poll_until_terminal(queue, &job_id, &settings, cancel).await {
        PollOutcome::Interrupted => Ok(SubmissionOutcome::Interrupted { job_id }),
        PollOutcome::Terminal(response) => finish(config, job_id, response).await,
    }
}

async fn finish(
    config: &ClientConfig,
    job_id: String,
    response: StatusResponse,
) -> Result<SubmissionOutcome, SubmitError> {
    if response.status != JobStatus::Completed {
        let error = response
            .error_text()
            .unwrap_or_else(|| "no error detail".to_string());
        return Err(SubmitError::JobFailed {
            job_id,
            status: response.status,
            error,
        });
    }

    let Some(output) = response.output else {
        return Err(SubmitError::InvalidOutput {
            job_id,
            reason: "output is missing".to_string(),
        });
    };
    let output: JobOutput = match serde_json::from_value(output) {
        Ok(output) => output,
        Err(e) => {
            return Err(SubmitError::InvalidOutput {
                job_id,
                reason: e.to_string(),
            })
        }
    };

    match output {
        JobOutput::Success { images } => {
            tracing::info!(job_id = %job_id, images = images.len(), "Job completed successfully");
            let files = save_artifacts(&config.output_dir, &config.output_prefix, &images).await?;
            Ok(SubmissionOutcome::Saved { job_id, files })
        }
        JobOutput::Error { message } => Err(SubmitError::Application { job_id, message }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use shroud_core::config::SharedSecret;

    use super::*;

    fn two_loader_graph() -> Graph {
        Graph::from_json(&json!({
            "12": { "class_type": "LoadImage", "inputs": { "image": "placeholder.png" } },
            "5": { "class_type": "LoadImage", "inputs": { "image": "placeholder.png" } },
            "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "old" } },
            "3": { "class_type": "KSampler", "inputs": { "seed": 42 } }
        }))
        .unwrap()
    }

    fn image(name: &str) -> ImageInput {
        ImageInput {
            filename: name.to_string(),
            bytes: name.as_bytes().to_vec(),
        }
    }

    #[test]
    fn plain_envelope_carries_bound_workflow() {
        let (envelope, report) = prepare_envelope(
            two_loader_graph(),
            vec![image("a.png"), image("b.png")],
            Some("a red fox".to_string()),
            SafetyToggles::from_debug(true),
            None,
        )
        .unwrap();

        assert_eq!(report.image_bindings.len(), 2);
        let Envelope::Plain { bundle, debug } = envelope else {
            panic!("expected a plain envelope");
        };
        assert!(debug);
        assert_eq!(bundle.workflow.get("5").unwrap().input("image"), Some(&json!("a.png")));
        assert_eq!(bundle.workflow.get("12").unwrap().input("image"), Some(&json!("b.png")));
        assert_eq!(bundle.workflow.get("6").unwrap().input("text"), Some(&json!("a red fox")));
        assert_eq!(bundle.images.keys().collect::<Vec<_>>(), vec!["a.png", "b.png"]);
    }

    #[test]
    fn sealed_envelope_requires_secret() {
        let result = prepare_envelope(
            two_loader_graph(),
            Vec::new(),
            None,
            SafetyToggles::default(),
            None,
        );
        assert!(matches!(
            result,
            Err(SubmitError::Envelope(EnvelopeError::MissingSecret))
        ));
    }

    #[test]
    fn sealed_envelope_opens_with_same_secret() {
        let cipher = PayloadCipher::new(&SharedSecret::new("s3cret").unwrap());
        let (envelope, _) = prepare_envelope(
            two_loader_graph(),
            vec![image("a.png")],
            None,
            SafetyToggles::default(),
            Some(&cipher),
        )
        .unwrap();
        assert!(envelope.is_encrypted());

        let opened = envelope.open(Some(&cipher)).unwrap();
        assert!(!opened.debug);
        assert_eq!(opened.bundle.images["a.png"], b"a.png".to_vec());
    }

    #[tokio::test]
    async fn missing_image_is_a_read_error() {
        let err = load_images(&[PathBuf::from("/definitely/not/here.png")])
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Read { .. }));
    }

    #[tokio::test]
    async fn workflow_file_must_be_json_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow_api.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(matches!(
            load_workflow(&path).await,
            Err(SubmitError::Workflow(_))
        ));
    }
}
