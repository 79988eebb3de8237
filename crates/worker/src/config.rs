//! Worker configuration, loaded once at startup.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use shroud_core::config::{optional_env, optional_env_secs, SharedSecret};
use shroud_core::error::CoreError;
use shroud_core::retry::RetryPolicy;

/// Attempts made to read a prompt's history entry.
pub const HISTORY_ATTEMPTS: u32 = 5;

/// Delay between history attempts.
pub const HISTORY_DELAY: Duration = Duration::from_secs(1);

/// Wait after completion before reading output files.
pub const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Execution handler configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// ComfyUI `host:port`.
    pub comfyui_address: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub secret: Option<SharedSecret>,
    /// `None` waits for the completion signal forever.
    pub monitor_timeout: Option<Duration>,
    pub history_retry: RetryPolicy,
    pub output_grace: Duration,
}

impl HandlerConfig {
    /// Load from environment variables.
    ///
    /// | Env var                | Default            |
    /// |------------------------|--------------------|
    /// | `COMFYUI_ADDRESS`      | `127.0.0.1:8188`   |
    /// | `COMFYUI_INPUT_DIR`    | `/ComfyUI/input`   |
    /// | `COMFYUI_OUTPUT_DIR`   | `/ComfyUI/output`  |
    /// | `PAYLOAD_SECRET`       | unset              |
    /// | `MONITOR_TIMEOUT_SECS` | unset (no timeout) |
    pub fn from_env() -> Result<Self, CoreError> {
        Ok(Self {
            comfyui_address: optional_env("COMFYUI_ADDRESS")
                .unwrap_or_else(|| "127.0.0.1:8188".to_string()),
            input_dir: optional_env("COMFYUI_INPUT_DIR")
                .unwrap_or_else(|| "/ComfyUI/input".to_string())
                .into(),
            output_dir: optional_env("COMFYUI_OUTPUT_DIR")
                .unwrap_or_else(|| "/ComfyUI/output".to_string())
                .into(),
            secret: SharedSecret::from_env(),
            monitor_timeout: optional_env_secs("MONITOR_TIMEOUT_SECS")?,
            history_retry: RetryPolicy::bounded(HISTORY_ATTEMPTS, HISTORY_DELAY),
            output_grace: OUTPUT_GRACE,
        })
    }
}

/// Model resolver configuration.
#[derive(Clone)]
pub struct ResolverConfig {
    /// Raw `repo:file:target_dir[:rename]` list, comma separated.
    pub models: Option<String>,
    /// Shared Hugging Face hub cache (`models--{org}--{name}/snapshots/...`).
    pub cache_dir: PathBuf,
    /// Base for relative target directories.
    pub base_dir: PathBuf,
    pub hf_endpoint: String,
    pub hf_token: Option<String>,
}

impl ResolverConfig {
    /// Load from environment variables.
    ///
    /// | Env var           | Default                                 |
    /// |-------------------|-----------------------------------------|
    /// | `MODELS`          | unset (nothing to provision)            |
    /// | `MODEL_CACHE_DIR` | `/runpod-volume/huggingface-cache/hub`  |
    /// | `MODEL_BASE_DIR`  | `.`                                     |
    /// | `HF_ENDPOINT`     | `https://huggingface.co`                |
    /// | `HF_TOKEN`        | unset                                   |
    pub fn from_env() -> Self {
        Self {
            models: optional_env("MODELS"),
            cache_dir: optional_env("MODEL_CACHE_DIR")
                .unwrap_or_else(|| "/runpod-volume/huggingface-cache/hub".to_string())
                .into(),
            base_dir: optional_env("MODEL_BASE_DIR")
                .unwrap_or_else(|| ".".to_string())
                .into(),
            hf_endpoint: optional_env("HF_ENDPOINT")
                .unwrap_or_else(|| "https://huggingface.co".to_string())
                .trim_end_matches('/')
                .to_string(),
            hf_token: optional_env("HF_TOKEN"),
        }
    }
}

impl fmt::Debug for ResolverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverConfig")
            .field("models", &self.models)
            .field("cache_dir", &self.cache_dir)
            .field("base_dir", &self.base_dir)
            .field("hf_endpoint", &self.hf_endpoint)
            .field("hf_token", &self.hf_token.as_ref().map(|_| "***"))
            .finish()
    }
}
