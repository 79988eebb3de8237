//! Moving job data in and out of ComfyUI's scratch directories.

use std::path::{Component, Path, PathBuf};

use indexmap::IndexMap;
use serde_json::Value;
use shroud_comfyui::history::OutputFile;
use shroud_core::graph::{Graph, NodeRole};
use shroud_core::injection::{bind_images_positionally, ImageBinding};
use shroud_core::secure_storage::{clear_directory, secure_delete, write_durable};

use crate::error::HandlerError;

/// Reject anything but a bare file name.
pub fn validate_filename(name: &str) -> Result<(), HandlerError> {
    let mut components = Path::new(name).components();
    let is_bare = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !is_bare || name.contains(['/', '\\', '\0']) {
        return Err(HandlerError::InvalidBundle(format!(
            "'{name}' is not a plain file name"
        )));
    }
    Ok(())
}

/// Write every auxiliary file into `input_dir`, each synced to disk
/// before the next one starts. Returns the staged names in order.
pub async fn stage_inputs(
    input_dir: &Path,
    files: IndexMap<String, Vec<u8>>,
) -> Result<Vec<String>, HandlerError> {
    for name in files.keys() {
        validate_filename(name)?;
    }

    let mut staged = Vec::with_capacity(files.len());
    for (filename, bytes) in files {
        let path = input_dir.join(&filename);
        let size = bytes.len();
        let written = tokio::task::spawn_blocking(move || write_durable(&path, &bytes))
            .await
            .map_err(std::io::Error::other)
            .and_then(|result| result);
        if let Err(source) = written {
            return Err(HandlerError::Staging { filename, source });
        }
        tracing::info!(filename = %filename, bytes = size, "Staged input");
        staged.push(filename);
    }
    Ok(staged)
}

/// Server-side image binding for clients that did not inject.
///
/// When no image loader already references one of the staged files, the
/// staged names are bound positionally to the loaders in numeric ID
/// order. A workflow already pointing at its inputs is left as is.
pub fn bind_legacy_images(workflow: &mut Graph, staged: &[String]) -> Vec<ImageBinding> {
    if staged.is_empty() {
        return Vec::new();
    }

    let already_bound = workflow.iter().any(|(_, node)| match node.class_type.role() {
        NodeRole::ImageLoader { image_param } => node
            .input(image_param)
            .and_then(Value::as_str)
            .is_some_and(|current| staged.iter().any(|s| s == current)),
        _ => false,
    });
    if already_bound {
        return Vec::new();
    }

    let bindings = bind_images_positionally(workflow, staged);
    for binding in &bindings {
        tracing::info!(
            node_id = %binding.node_id,
            filename = %binding.filename,
            "Bound staged image to loader node",
        );
    }
    bindings
}

/// Where ComfyUI put `file`, or `None` if the reported location would
/// leave the output directory.
pub fn output_path(output_dir: &Path, file: &OutputFile) -> Option<PathBuf> {
    validate_filename(&file.filename).ok()?;
    let subfolder = Path::new(&file.subfolder);
    if !subfolder
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(output_dir.join(subfolder).join(&file.filename))
}

/// Read every produced file. Files listed in history but missing on disk
/// are logged and skipped. Returns the artifacts and the paths read.
pub async fn collect_outputs(
    output_dir: &Path,
    files: &[OutputFile],
) -> (IndexMap<String, Vec<u8>>, Vec<PathBuf>) {
    let mut artifacts = IndexMap::new();
    let mut paths = Vec::new();

    for file in files {
        let Some(path) = output_path(output_dir, file) else {
            tracing::warn!(
                filename = %file.filename,
                subfolder = %file.subfolder,
                "Ignoring output outside the output directory",
            );
            continue;
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let key = artifact_key(&artifacts, &file.filename);
                if key != file.filename {
                    tracing::warn!(
                        filename = %file.filename,
                        subfolder = %file.subfolder,
                        renamed = %key,
                        "Output filename already collected; renaming",
                    );
                }
                tracing::info!(filename = %key, bytes = bytes.len(), "Collected output");
                artifacts.insert(key, bytes);
                paths.push(path);
            }
            Err(e) => {
                tracing::warn!(
                    filename = %file.filename,
                    error = %e,
                    "Expected output file missing",
                );
            }
        }
    }
    (artifacts, paths)
}

/// `filename`, or `stem_N.ext` for the first `N >= 2` not yet taken.
fn artifact_key(artifacts: &IndexMap<String, Vec<u8>>, filename: &str) -> String {
    if !artifacts.contains_key(filename) {
        return filename.to_string();
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (filename, String::new()),
    };
    (2..)
        .map(|n| format!("{stem}_{n}{ext}"))
        .find(|candidate| !artifacts.contains_key(candidate))
        .unwrap_or_else(|| filename.to_string())
}

/// Wipes the scratch directories when dropped, unless preserved.
///
/// Dropping covers every exit: normal return, early `?`, and the handler
/// future being dropped on a termination signal.
pub struct ScratchGuard {
    dirs: Vec<PathBuf>,
    extra_files: Vec<PathBuf>,
    preserve: bool,
}

impl ScratchGuard {
    pub fn new(input_dir: &Path, output_dir: &Path) -> Self {
        Self {
            dirs: vec![input_dir.to_path_buf(), output_dir.to_path_buf()],
            extra_files: Vec::new(),
            preserve: false,
        }
    }

    /// Leave everything on disk (debug mode).
    pub fn preserve(&mut self, preserve: bool) {
        self.preserve = preserve;
    }

    /// Also wipe `paths`, e.g. outputs written into subfolders.
    pub fn track(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        self.extra_files.extend(paths);
    }

    /// Securely clear the scratch directories now.
    pub fn purge(&self) {
        for dir in &self.dirs {
            clear_directory(dir);
        }
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if self.preserve {
            tracing::warn!(
                dirs = ?self.dirs,
                "DEBUG MODE: scratch files preserved",
            );
            return;
        }
        for path in &self.extra_files {
            secure_delete(path);
        }
        self.purge();
    }
}
