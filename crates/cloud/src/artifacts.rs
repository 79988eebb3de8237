//! Writing returned artifacts to local storage.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::submit::SubmitError;

/// Write each artifact to `dir` as `{prefix}{basename}`.
///
/// Only the final path component of a returned name is used, so a
/// hostile name cannot escape `dir`. Names with no usable component are
/// skipped with a warning. Returns the written paths in order.
pub async fn save_artifacts(
    dir: &Path,
    prefix: &str,
    artifacts: &IndexMap<String, Vec<u8>>,
) -> Result<Vec<PathBuf>, SubmitError> {
    if artifacts.is_empty() {
        tracing::info!("Job succeeded but no output images were returned");
        return Ok(Vec::new());
    }

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| SubmitError::Write {
            path: dir.to_path_buf(),
            source,
        })?;

    let mut saved = Vec::with_capacity(artifacts.len());
    for (name, bytes) in artifacts {
        let Some(base) = Path::new(name).file_name().and_then(|n| n.to_str()) else {
            tracing::warn!(filename = %name, "Skipping artifact with unusable name");
            continue;
        };
        let path = dir.join(format!("{prefix}{base}"));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| SubmitError::Write {
                path: path.clone(),
                source,
            })?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "Saved artifact");
        saved.push(path);
    }
    Ok(saved)
}
