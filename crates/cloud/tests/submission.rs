use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::json;
use shroud_cloud::config::ClientConfig;
use shroud_cloud::queue::{JobQueue, JobStatus, QueueError, StatusResponse};
use shroud_cloud::submit::{run_submission, SubmissionOutcome, SubmitError, SubmitRequest};
use shroud_core::config::{SafetyToggles, SharedSecret};
use shroud_core::envelope::{Envelope, PayloadCipher};
use shroud_core::graph::Graph;
use shroud_core::job::JobOutput;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "integration-secret";

// ---------------------------------------------------------------------------
// Fake queue
// ---------------------------------------------------------------------------

struct FakeQueue {
    job_id: Option<String>,
    statuses: Mutex<VecDeque<Result<StatusResponse, QueueError>>>,
    submitted: Mutex<Vec<Envelope>>,
    status_calls: Mutex<u32>,
}

impl FakeQueue {
    fn new(statuses: Vec<Result<StatusResponse, QueueError>>) -> Self {
        Self {
            job_id: Some("job-42".to_string()),
            statuses: Mutex::new(statuses.into()),
            submitted: Mutex::new(Vec::new()),
            status_calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl JobQueue for FakeQueue {
    async fn submit(&self, envelope: &Envelope) -> Result<String, QueueError> {
        self.submitted.lock().unwrap().push(envelope.clone());
        self.job_id
            .clone()
            .ok_or_else(|| QueueError::MissingJobId("{}".to_string()))
    }

    async fn status(&self, _job_id: &str) -> Result<StatusResponse, QueueError> {
        *self.status_calls.lock().unwrap() += 1;
        // Once the script runs out the job just keeps running.
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(status(json!({ "status": "IN_PROGRESS" }))))
    }
}

fn status(value: serde_json::Value) -> StatusResponse {
    serde_json::from_value(value).unwrap()
}

fn completed_with(output: JobOutput) -> StatusResponse {
    status(json!({
        "id": "job-42",
        "status": "COMPLETED",
        "output": serde_json::to_value(output).unwrap()
    }))
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn config(output_dir: &Path) -> ClientConfig {
    ClientConfig {
        endpoint_url: "http://queue.invalid".to_string(),
        api_key: "key".to_string(),
        secret: Some(SharedSecret::new(SECRET).unwrap()),
        poll_interval: Duration::from_millis(1),
        transient_backoff: Duration::from_millis(1),
        output_prefix: "out_".to_string(),
        output_dir: output_dir.to_path_buf(),
    }
}

fn workflow() -> Graph {
    Graph::from_json(&json!({
        "12": { "class_type": "LoadImage", "inputs": { "image": "example.png" } },
        "5": { "class_type": "LoadImage", "inputs": { "image": "example.png" } },
        "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "placeholder", "clip": ["4", 1] } },
        "3": { "class_type": "KSampler", "inputs": { "seed": 7, "steps": 20 } }
    }))
    .unwrap()
}

fn write_images(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            std::fs::write(&path, format!("bytes of {name}")).unwrap();
            path
        })
        .collect()
}

fn request(image_paths: Vec<PathBuf>, debug: bool) -> SubmitRequest {
    SubmitRequest {
        workflow: workflow(),
        image_paths,
        prompt: Some("a lighthouse at dusk".to_string()),
        toggles: SafetyToggles::from_debug(debug),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sealed_submission_binds_inputs_and_saves_prefixed_output() {
    let inputs = tempfile::tempdir().unwrap();
    let outputs = tempfile::tempdir().unwrap();
    let images = write_images(inputs.path(), &["a.png", "b.png"]);

    let mut produced = IndexMap::new();
    produced.insert("ComfyUI_00001_.png".to_string(), b"result pixels".to_vec());

    let queue = FakeQueue::new(vec![
        Err(QueueError::Api {
            status: 502,
            body: "bad gateway".to_string(),
        }),
        Ok(status(json!({ "status": "IN_QUEUE" }))),
        Ok(status(json!({ "status": "IN_PROGRESS", "progress": "Step 10/20" }))),
        Ok(completed_with(JobOutput::Success { images: produced })),
    ]);

    let outcome = run_submission(
        &queue,
        &config(outputs.path()),
        request(images, false),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let expected = outputs.path().join("out_ComfyUI_00001_.png");
    assert_eq!(
        outcome,
        SubmissionOutcome::Saved {
            job_id: "job-42".to_string(),
            files: vec![expected.clone()],
        }
    );
    assert_eq!(std::fs::read(expected).unwrap(), b"result pixels");
    assert_eq!(*queue.status_calls.lock().unwrap(), 4);

    let envelope = queue.submitted.lock().unwrap()[0].clone();
    assert!(envelope.is_encrypted());
    let cipher = PayloadCipher::new(&SharedSecret::new(SECRET).unwrap());
    let opened = envelope.open(Some(&cipher)).unwrap();
    let graph = &opened.bundle.workflow;
    assert_eq!(graph.get("5").unwrap().input("image"), Some(&json!("a.png")));
    assert_eq!(graph.get("12").unwrap().input("image"), Some(&json!("b.png")));
    assert_eq!(
        graph.get("6").unwrap().input("text"),
        Some(&json!("a lighthouse at dusk"))
    );
    let seed = graph.get("3").unwrap().input("seed").unwrap().as_u64().unwrap();
    assert!((1..=1_000_000_000_000_000).contains(&seed));
    assert_eq!(opened.bundle.images["a.png"], b"bytes of a.png".to_vec());
    assert_eq!(opened.bundle.images["b.png"], b"bytes of b.png".to_vec());
}

#[tokio::test]
async fn surplus_images_are_dropped_but_job_still_submits() {
    let inputs = tempfile::tempdir().unwrap();
    let outputs = tempfile::tempdir().unwrap();
    let images = write_images(inputs.path(), &["a.png", "b.png", "c.png"]);

    let mut req = request(images, true);
    req.workflow = Graph::from_json(&json!({
        "10": { "class_type": "LoadImage", "inputs": { "image": "x.png" } }
    }))
    .unwrap();

    let queue = FakeQueue::new(vec![Ok(completed_with(JobOutput::Success {
        images: IndexMap::new(),
    }))]);
    let outcome = run_submission(&queue, &config(outputs.path()), req, &CancellationToken::new())
        .await
        .unwrap();
    assert_matches!(outcome, SubmissionOutcome::Saved { files, .. } if files.is_empty());

    let envelope = queue.submitted.lock().unwrap()[0].clone();
    let Envelope::Plain { bundle, debug } = envelope else {
        panic!("debug submissions are plain");
    };
    assert!(debug);
    assert_eq!(bundle.images.keys().collect::<Vec<_>>(), vec!["a.png"]);
}

#[tokio::test]
async fn worker_error_inside_completed_job_is_application_error() {
    let outputs = tempfile::tempdir().unwrap();
    let queue = FakeQueue::new(vec![Ok(completed_with(JobOutput::failure(
        "Execution failed at node 8: CUDA out of memory",
    )))]);

    let err = run_submission(
        &queue,
        &config(outputs.path()),
        request(Vec::new(), false),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_matches!(err, SubmitError::Application { job_id, message }
        if job_id == "job-42" && message.contains("CUDA out of memory"));
}

#[tokio::test]
async fn failed_job_surfaces_queue_error_detail() {
    let outputs = tempfile::tempdir().unwrap();
    let queue = FakeQueue::new(vec![
        Ok(status(json!({ "status": "IN_PROGRESS" }))),
        Ok(status(json!({ "status": "FAILED", "error": "worker exited with code 137" }))),
    ]);

    let err = run_submission(
        &queue,
        &config(outputs.path()),
        request(Vec::new(), false),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_matches!(err, SubmitError::JobFailed { status: JobStatus::Failed, error, .. }
        if error == "worker exited with code 137");
}

#[tokio::test]
async fn transient_status_errors_are_retried_until_terminal() {
    let outputs = tempfile::tempdir().unwrap();
    let queue = FakeQueue::new(vec![
        Err(QueueError::Api {
            status: 503,
            body: "unavailable".to_string(),
        }),
        Err(QueueError::Api {
            status: 502,
            body: "bad gateway".to_string(),
        }),
        Ok(status(json!({ "status": "FAILED", "error": "worker exited with code 1" }))),
    ]);

    let err = run_submission(
        &queue,
        &config(outputs.path()),
        request(Vec::new(), false),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_matches!(err, SubmitError::JobFailed { status: JobStatus::Failed, .. });
    assert_eq!(*queue.status_calls.lock().unwrap(), 3);
}

#[tokio::test]
async fn missing_job_id_aborts_without_polling() {
    let outputs = tempfile::tempdir().unwrap();
    let mut queue = FakeQueue::new(Vec::new());
    queue.job_id = None;

    let err = run_submission(
        &queue,
        &config(outputs.path()),
        request(Vec::new(), false),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_matches!(err, SubmitError::Queue(QueueError::MissingJobId(_)));
    assert_eq!(*queue.status_calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn interruption_stops_polling_and_reports_job_id() {
    let outputs = tempfile::tempdir().unwrap();
    let queue = FakeQueue::new(Vec::new());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = run_submission(
        &queue,
        &config(outputs.path()),
        request(Vec::new(), false),
        &cancel,
    )
    .await
    .unwrap();

    assert_eq!(
        outcome,
        SubmissionOutcome::Interrupted {
            job_id: "job-42".to_string()
        }
    );
    assert!(*queue.status_calls.lock().unwrap() >= 1);
}
