//! Transport envelope for a workflow plus its auxiliary files.
//!
//! On the wire a job input is either plain:
//!
//! ```json
//! { "encrypted": false, "workflow": { ... }, "images": { "a.png": "<base64>" }, "debug": false }
//! ```
//!
//! or sealed:
//!
//! ```json
//! { "encrypted": true, "payload": "<token>" }
//! ```
//!
//! The `encrypted` flag always travels in the clear so the receiver can
//! pick the unsealing path before touching the payload. The token is
//! URL-safe base64 of `nonce || ciphertext` under AES-256-GCM, keyed by
//! SHA-256 of the shared secret. A sealed envelope never falls back to
//! plaintext interpretation.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use indexmap::IndexMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{SafetyToggles, SharedSecret};
use crate::graph::Graph;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Sealing or unsealing was requested but no shared secret is configured.
    #[error("Encrypted payload requires a shared secret, but none is configured")]
    MissingSecret,

    /// The token is not valid base64 or is too short to hold a nonce.
    #[error("Malformed encrypted payload: {0}")]
    MalformedToken(String),

    /// Authentication failed: wrong key or tampered ciphertext.
    #[error("Failed to decrypt payload (wrong secret or corrupted data)")]
    Decryption,

    #[error("Failed to encrypt payload")]
    Encryption,

    /// The job input is not a well-formed envelope.
    #[error("Invalid job input: {0}")]
    InvalidInput(String),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// The unit that is transported: a bound workflow plus the files it needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobBundle {
    pub workflow: Graph,
    /// Auxiliary input files by filename, in binding order.
    #[serde(default, with = "crate::encoding::file_map")]
    pub images: IndexMap<String, Vec<u8>>,
}

impl JobBundle {
    /// Canonical byte form used as the sealed plaintext.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes)
            .map_err(|e| EnvelopeError::InvalidInput(format!("decrypted bundle is malformed: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Cipher
// ---------------------------------------------------------------------------

/// Authenticated symmetric cipher keyed by the shared secret.
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl PayloadCipher {
    pub fn new(secret: &SharedSecret) -> Self {
        let key = Sha256::digest(secret.expose());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, EnvelopeError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| EnvelopeError::Encryption)?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    /// Authenticate and decrypt a token produced by [`seal`](Self::seal).
    pub fn open(&self, token: &str) -> Result<Vec<u8>, EnvelopeError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| EnvelopeError::MalformedToken(e.to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(EnvelopeError::MalformedToken(format!(
                "token is {} bytes, shorter than a nonce plus tag",
                raw.len()
            )));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EnvelopeError::Decryption)
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadCipher(***)")
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A job input as transmitted. Exactly one variant per transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawJobInput", into = "RawJobInput")]
pub enum Envelope {
    Plain { bundle: JobBundle, debug: bool },
    Encrypted { token: String },
}

/// Contents of an envelope after unsealing.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedEnvelope {
    pub bundle: JobBundle,
    /// External debug flag; always `false` for sealed envelopes.
    pub debug: bool,
}

impl Envelope {
    /// Wrap `bundle` according to `toggles`.
    ///
    /// With `encrypt_payload` set a cipher is mandatory; otherwise the
    /// bundle is sent plain with `debug` mirroring `preserve_scratch`.
    pub fn build(
        bundle: JobBundle,
        toggles: SafetyToggles,
        cipher: Option<&PayloadCipher>,
    ) -> Result<Self, EnvelopeError> {
        if toggles.encrypt_payload {
            let cipher = cipher.ok_or(EnvelopeError::MissingSecret)?;
            let token = cipher.seal(&bundle.to_bytes()?)?;
            Ok(Envelope::Encrypted { token })
        } else {
            Ok(Envelope::Plain {
                bundle,
                debug: toggles.preserve_scratch,
            })
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Envelope::Encrypted { .. })
    }

    /// Parse a job input JSON document.
    pub fn from_json(value: serde_json::Value) -> Result<Self, EnvelopeError> {
        serde_json::from_value(value).map_err(|e| EnvelopeError::InvalidInput(e.to_string()))
    }

    /// Recover the bundle. Sealed envelopes require `cipher`.
    pub fn open(self, cipher: Option<&PayloadCipher>) -> Result<OpenedEnvelope, EnvelopeError> {
        match self {
            Envelope::Plain { bundle, debug } => Ok(OpenedEnvelope { bundle, debug }),
            Envelope::Encrypted { token } => {
                let cipher = cipher.ok_or(EnvelopeError::MissingSecret)?;
                let plaintext = cipher.open(&token)?;
                Ok(OpenedEnvelope {
                    bundle: JobBundle::from_bytes(&plaintext)?,
                    debug: false,
                })
            }
        }
    }
}

/// Flat wire shape shared by both envelope variants.
#[derive(Serialize, Deserialize)]
struct RawJobInput {
    #[serde(default)]
    encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workflow: Option<Graph>,
    #[serde(
        default,
        with = "crate::encoding::file_map",
        skip_serializing_if = "IndexMap::is_empty"
    )]
    images: IndexMap<String, Vec<u8>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    debug: bool,
}

impl TryFrom<RawJobInput> for Envelope {
    type Error = String;

    fn try_from(raw: RawJobInput) -> Result<Self, Self::Error> {
        if raw.encrypted {
            let token = raw
                .payload
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| "encrypted input is missing 'payload'".to_string())?;
            return Ok(Envelope::Encrypted { token });
        }

        let workflow = raw
            .workflow
            .ok_or_else(|| "Missing 'workflow' in input payload".to_string())?;
        Ok(Envelope::Plain {
            bundle: JobBundle {
                workflow,
                images: raw.images,
            },
            debug: raw.debug,
        })
    }
}

impl From<Envelope> for RawJobInput {
    fn from(envelope: Envelope) -> Self {
        match envelope {
            Envelope::Plain { bundle, debug } => RawJobInput {
                encrypted: false,
                payload: None,
                workflow: Some(bundle.workflow),
                images: bundle.images,
                debug,
            },
            Envelope::Encrypted { token } => RawJobInput {
                encrypted: true,
                payload: Some(token),
                workflow: None,
                images: IndexMap::new(),
                debug: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn bundle() -> JobBundle {
        let workflow = Graph::from_json(&json!({
            "5": { "class_type": "LoadImage", "inputs": { "image": "a.png" } }
        }))
        .unwrap();
        let mut images = IndexMap::new();
        images.insert("a.png".to_string(), vec![137, 80, 78, 71, 0, 255]);
        JobBundle { workflow, images }
    }

    fn cipher(secret: &str) -> PayloadCipher {
        PayloadCipher::new(&SharedSecret::new(secret).unwrap())
    }

    #[test]
    fn sealed_bundle_round_trips() {
        let c = cipher("correct horse");
        let envelope = Envelope::build(bundle(), SafetyToggles::default(), Some(&c)).unwrap();
        assert!(envelope.is_encrypted());

        let opened = envelope.open(Some(&c)).unwrap();
        assert_eq!(opened.bundle, bundle());
        assert!(!opened.debug);
    }

    #[test]
    fn wrong_key_always_fails() {
        let envelope =
            Envelope::build(bundle(), SafetyToggles::default(), Some(&cipher("one"))).unwrap();
        assert_matches!(
            envelope.open(Some(&cipher("two"))),
            Err(EnvelopeError::Decryption)
        );
    }

    #[test]
    fn tampered_token_fails_authentication() {
        let c = cipher("k");
        let token = c.seal(b"hello world").unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert_matches!(c.open(&tampered), Err(EnvelopeError::Decryption));
        assert_matches!(c.open("@@@"), Err(EnvelopeError::MalformedToken(_)));
        assert_matches!(c.open("AAAA"), Err(EnvelopeError::MalformedToken(_)));
    }

    #[test]
    fn sealing_uses_fresh_nonces() {
        let c = cipher("k");
        assert_ne!(c.seal(b"same").unwrap(), c.seal(b"same").unwrap());
    }

    #[test]
    fn encryption_without_secret_is_refused() {
        assert_matches!(
            Envelope::build(bundle(), SafetyToggles::default(), None),
            Err(EnvelopeError::MissingSecret)
        );
        let sealed = Envelope::Encrypted {
            token: "abc".to_string(),
        };
        assert_matches!(sealed.open(None), Err(EnvelopeError::MissingSecret));
    }

    #[test]
    fn debug_mode_sends_plain_with_flag() {
        let envelope = Envelope::build(bundle(), SafetyToggles::from_debug(true), None).unwrap();
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["encrypted"], false);
        assert_eq!(wire["debug"], true);
        assert_eq!(wire["workflow"]["5"]["inputs"]["image"], "a.png");
        assert!(wire["images"]["a.png"].is_string());
    }

    #[test]
    fn encrypted_wire_form_carries_flag_in_clear() {
        let c = cipher("k");
        let envelope = Envelope::build(bundle(), SafetyToggles::default(), Some(&c)).unwrap();
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["encrypted"], true);
        assert!(wire.get("workflow").is_none());

        let parsed = Envelope::from_json(wire).unwrap();
        assert_eq!(parsed.open(Some(&c)).unwrap().bundle, bundle());
    }

    #[test]
    fn legacy_input_without_flag_is_plain() {
        let parsed = Envelope::from_json(json!({
            "workflow": { "1": { "class_type": "SaveImage", "inputs": {} } }
        }))
        .unwrap();
        assert_matches!(parsed, Envelope::Plain { debug: false, ref bundle } if bundle.images.is_empty());
    }

    #[test]
    fn plain_input_without_workflow_is_invalid() {
        assert_matches!(
            Envelope::from_json(json!({ "images": {} })),
            Err(EnvelopeError::InvalidInput(msg)) if msg.contains("workflow")
        );
        assert_matches!(
            Envelope::from_json(json!({ "encrypted": true })),
            Err(EnvelopeError::InvalidInput(msg)) if msg.contains("payload")
        );
    }
}
