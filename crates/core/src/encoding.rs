//! Base64 transport encoding for binary blobs carried inside JSON.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Encode raw bytes as standard (padded) base64.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64 into raw bytes.
pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text.trim())
}

/// Serde adapter for `filename -> bytes` maps that travel as
/// `filename -> base64 string` JSON objects.
///
/// Use with `#[serde(with = "crate::encoding::file_map")]`.
pub mod file_map {
    use indexmap::IndexMap;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(files: &IndexMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: IndexMap<&str, String> = files
            .iter()
            .map(|(name, bytes)| (name.as_str(), super::encode(bytes)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<IndexMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = IndexMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, text)| {
                super::decode(&text)
                    .map(|bytes| (name.clone(), bytes))
                    .map_err(|e| D::Error::custom(format!("file '{name}' is not valid base64: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;

    #[test]
    fn decode_tolerates_surrounding_whitespace() {
        assert_eq!(decode("  aGVsbG8=\n").unwrap(), b"hello");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode("not base64 !!").is_err());
    }

    #[test]
    fn file_map_serializes_as_base64_strings() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Holder {
            #[serde(with = "file_map")]
            files: IndexMap<String, Vec<u8>>,
        }

        let mut files = IndexMap::new();
        files.insert("a.png".to_string(), vec![0u8, 1, 2]);
        let json = serde_json::to_value(Holder { files }).unwrap();
        assert_eq!(json["files"]["a.png"], "AAEC");

        let bad = serde_json::json!({ "files": { "b.png": "%%%" } });
        let err = serde_json::from_value::<Holder>(bad).err().unwrap();
        assert!(err.to_string().contains("b.png"));
    }
}
