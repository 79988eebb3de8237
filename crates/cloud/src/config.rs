use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use shroud_core::config::{optional_env_secs, required_env, SharedSecret};
use shroud_core::error::CoreError;

/// Default seconds between status checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Backoff after a failed status request.
pub const DEFAULT_TRANSIENT_BACKOFF: Duration = Duration::from_secs(5);

/// Prefix for every artifact written locally.
pub const DEFAULT_OUTPUT_PREFIX: &str = "out_";

/// Submission client configuration, built once at startup.
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL of the queue endpoint; `/run` and `/status/{id}` hang off it.
    pub endpoint_url: String,
    pub api_key: String,
    pub secret: Option<SharedSecret>,
    pub poll_interval: Duration,
    pub transient_backoff: Duration,
    pub output_prefix: String,
    pub output_dir: PathBuf,
}

impl ClientConfig {
    /// Load from environment variables.
    ///
    /// | Env var               | Required | Default |
    /// |-----------------------|----------|---------|
    /// | `QUEUE_ENDPOINT_URL`  | yes      | -       |
    /// | `QUEUE_API_KEY`       | yes      | -       |
    /// | `PAYLOAD_SECRET`      | no       | -       |
    /// | `POLL_INTERVAL_SECS`  | no       | `2`     |
    pub fn from_env() -> Result<Self, CoreError> {
        let endpoint_url = required_env("QUEUE_ENDPOINT_URL")?
            .trim_end_matches('/')
            .to_string();
        let api_key = required_env("QUEUE_API_KEY")?;

        Ok(Self {
            endpoint_url,
            api_key,
            secret: SharedSecret::from_env(),
            poll_interval: optional_env_secs("POLL_INTERVAL_SECS")?
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            transient_backoff: DEFAULT_TRANSIENT_BACKOFF,
            output_prefix: DEFAULT_OUTPUT_PREFIX.to_string(),
            output_dir: PathBuf::from("."),
        })
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("api_key", &"***")
            .field("secret", &self.secret)
            .field("poll_interval", &self.poll_interval)
            .field("transient_backoff", &self.transient_backoff)
            .field("output_prefix", &self.output_prefix)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}
