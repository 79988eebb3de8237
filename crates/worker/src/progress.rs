use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;

/// Receives human-readable progress for the running job, e.g. `Step 4/20`.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: &str);
}

#[derive(Serialize)]
struct ProgressLine<'a> {
    job_id: &'a str,
    progress: &'a str,
}

/// Writes one `{"job_id": ..., "progress": "Step n/m"}` JSON line per
/// update, for the queue integration to copy into the job's `progress`
/// field. The final job result is a separate line carrying `status`.
pub struct JsonLinesProgress<W> {
    job_id: String,
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesProgress<W> {
    pub fn new(job_id: impl Into<String>, out: W) -> Self {
        Self {
            job_id: job_id.into(),
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send> ProgressReporter for JsonLinesProgress<W> {
    fn report(&self, progress: &str) {
        tracing::info!(progress, "Job progress");
        let line = ProgressLine {
            job_id: &self.job_id,
            progress,
        };
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let written = serde_json::to_writer(&mut *out, &line)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(out))
            .and_then(|()| out.flush());
        if let Err(e) = written {
            tracing::warn!(error = %e, "Failed to write progress line");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn progress_is_one_json_object_per_line() {
        let reporter = JsonLinesProgress::new("job-7", Vec::new());
        reporter.report("Step 1/20");
        reporter.report("Step 2/20");

        let text = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            lines,
            vec![
                json!({ "job_id": "job-7", "progress": "Step 1/20" }),
                json!({ "job_id": "job-7", "progress": "Step 2/20" }),
            ]
        );
    }
}
