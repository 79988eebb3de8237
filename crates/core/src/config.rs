//! Configuration pieces shared by the submission client and the worker.
//!
//! Each binary builds its own config struct once at startup (see
//! `ClientConfig` and `HandlerConfig`) from the helpers here and passes it
//! down by reference.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;

/// Environment variable holding the shared symmetric payload secret.
pub const PAYLOAD_SECRET_ENV: &str = "PAYLOAD_SECRET";

/// Shared secret used to derive the payload encryption key.
///
/// `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(String);

impl SharedSecret {
    /// Wrap a secret; empty or whitespace-only values are rejected.
    pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(CoreError::Config(
                "Shared secret must not be empty".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Read [`PAYLOAD_SECRET_ENV`]; `None` when unset or blank.
    pub fn from_env() -> Option<Self> {
        optional_env(PAYLOAD_SECRET_ENV).and_then(|v| Self::new(v).ok())
    }

    pub fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(***)")
    }
}

/// The two concerns the external debug flag controls, kept separate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyToggles {
    /// Seal the job payload with the shared secret.
    pub encrypt_payload: bool,
    /// Leave staged inputs and produced outputs on disk after the job,
    /// and skip the pre-job purge.
    pub preserve_scratch: bool,
}

impl SafetyToggles {
    /// Map the single external debug flag onto both toggles.
    ///
    /// Debug mode is a troubleshooting escape hatch: no encryption, no
    /// purge, no secure cleanup. Never enable it for untrusted input.
    pub fn from_debug(debug: bool) -> Self {
        Self {
            encrypt_payload: !debug,
            preserve_scratch: debug,
        }
    }
}

impl Default for SafetyToggles {
    fn default() -> Self {
        Self::from_debug(false)
    }
}

/// Read an environment variable, treating unset and blank the same.
pub fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a required environment variable.
pub fn required_env(name: &str) -> Result<String, CoreError> {
    optional_env(name)
        .ok_or_else(|| CoreError::Config(format!("{name} environment variable is required")))
}

/// Parse an optional environment variable, falling back to `default`.
pub fn parse_env_or<T: FromStr>(name: &str, default: T) -> Result<T, CoreError> {
    match optional_env(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| CoreError::Config(format!("{name} has an invalid value: '{raw}'"))),
        None => Ok(default),
    }
}

/// Parse an optional whole-seconds duration variable.
pub fn optional_env_secs(name: &str) -> Result<Option<Duration>, CoreError> {
    match optional_env(name) {
        Some(raw) => raw
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| {
                CoreError::Config(format!("{name} must be a whole number of seconds, got '{raw}'"))
            }),
        None => Ok(None),
    }
}
