//! Model resolver.
//!
//! Turns the `MODELS` list into files under ComfyUI's model directories.
//! A model found in the shared hub cache is symlinked into place; anything
//! else is downloaded straight into its target directory. One bad entry
//! never stops the others.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::config::ResolverConfig;

// ---------------------------------------------------------------------------
// Model list
// ---------------------------------------------------------------------------

/// One `repo:file:target_dir[:rename]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub repo_id: String,
    /// Path of the file inside the repo; may contain subdirectories.
    pub remote_file: String,
    /// Absolute, or relative to the resolver's base directory.
    pub target_dir: PathBuf,
    pub rename: Option<String>,
}

impl ModelSpec {
    /// Local file name: the rename if given, else the remote basename.
    pub fn final_name(&self) -> &str {
        match self.rename.as_deref() {
            Some(name) => name,
            None => self
                .remote_file
                .rsplit('/')
                .next()
                .unwrap_or(&self.remote_file),
        }
    }
}

/// Parse a comma-separated list of colon-separated entries.
///
/// Entries with fewer than three fields are skipped with a warning.
pub fn parse_models(raw: &str) -> Vec<ModelSpec> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            if parts.len() < 3 {
                tracing::warn!(entry, "Skipping model entry: expected repo:file:target_dir[:rename]");
                return None;
            }
            Some(ModelSpec {
                repo_id: parts[0].to_string(),
                remote_file: parts[1].to_string(),
                target_dir: PathBuf::from(parts[2]),
                rename: parts
                    .get(3)
                    .filter(|name| !name.is_empty())
                    .map(|name| name.to_string()),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Errors / report
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Refusing unsafe model path '{0}'")]
    UnsafePath(String),

    #[error("Download of {repo_id}/{file} failed: {reason}")]
    Download {
        repo_id: String,
        file: String,
        reason: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ProvisionError + '_ {
    move |source| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    AlreadyPresent,
    /// Symlinked to this file in the shared cache.
    Linked { source: PathBuf },
    Downloaded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionEntry {
    pub spec: ModelSpec,
    pub path: PathBuf,
    pub outcome: ProvisionOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub entries: Vec<ProvisionEntry>,
}

impl ProvisionReport {
    pub fn failures(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, ProvisionOutcome::Failed(_)))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Downloads a model file when the shared cache does not have it.
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    /// Fetch `remote_file` of `repo_id` for `dest`, returning where it
    /// landed. A fetcher that mirrors the repository layout may place it
    /// below `dest`'s directory instead; the resolver moves it into place.
    async fn fetch(
        &self,
        repo_id: &str,
        remote_file: &str,
        dest: &Path,
    ) -> Result<PathBuf, ProvisionError>;
}

/// [`ModelFetcher`] using the Hugging Face `resolve` endpoint.
pub struct HuggingFaceFetcher {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HuggingFaceFetcher {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            token,
        }
    }

    async fn download_to(
        &self,
        url: &str,
        part_path: &Path,
    ) -> Result<(), ProvisionError> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let mut response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::Download {
                repo_id: String::new(),
                file: url.to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        let mut file = tokio::fs::File::create(part_path)
            .await
            .map_err(io_err(part_path))?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await.map_err(io_err(part_path))?;
        }
        file.flush().await.map_err(io_err(part_path))?;
        file.sync_all().await.map_err(io_err(part_path))?;
        Ok(())
    }
}

#[async_trait]
impl ModelFetcher for HuggingFaceFetcher {
    async fn fetch(
        &self,
        repo_id: &str,
        remote_file: &str,
        dest: &Path,
    ) -> Result<PathBuf, ProvisionError> {
        safe_relative(remote_file)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err(parent))?;
        }
        let part_path = part_path(dest);

        let url = format!("{}/{}/resolve/main/{}", self.endpoint, repo_id, remote_file);
        tracing::info!(repo_id, file = remote_file, "Downloading model");

        if let Err(e) = self.download_to(&url, &part_path).await {
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(match e {
                ProvisionError::Download { reason, .. } => ProvisionError::Download {
                    repo_id: repo_id.to_string(),
                    file: remote_file.to_string(),
                    reason,
                },
                other => other,
            });
        }

        tokio::fs::rename(&part_path, dest)
            .await
            .map_err(io_err(dest))?;
        Ok(dest.to_path_buf())
    }
}

/// In-progress download location for `dest`: `dest` plus `.part`.
fn part_path(dest: &Path) -> PathBuf {
    let mut part = dest.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

fn safe_relative(remote_file: &str) -> Result<&Path, ProvisionError> {
    let path = Path::new(remote_file);
    let safe = path.components().count() > 0
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(path)
    } else {
        Err(ProvisionError::UnsafePath(remote_file.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Directory name the hub cache uses for `repo_id`.
pub fn cache_folder_name(repo_id: &str) -> String {
    format!("models--{}", repo_id.replace('/', "--"))
}

pub struct ModelResolver {
    config: ResolverConfig,
    fetcher: Box<dyn ModelFetcher>,
}

impl ModelResolver {
    pub fn new(config: ResolverConfig, fetcher: Box<dyn ModelFetcher>) -> Self {
        Self { config, fetcher }
    }

    /// Resolve every entry of the configured `MODELS` list.
    pub async fn provision(&self) -> ProvisionReport {
        let specs = self
            .config
            .models
            .as_deref()
            .map(parse_models)
            .unwrap_or_default();
        self.provision_all(&specs).await
    }

    pub async fn provision_all(&self, specs: &[ModelSpec]) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        if specs.is_empty() {
            return report;
        }

        let cache_mounted = tokio::fs::try_exists(&self.config.cache_dir)
            .await
            .unwrap_or(false);
        tracing::info!(
            models = specs.len(),
            cache = %self.config.cache_dir.display(),
            cache_mounted,
            "Provisioning models",
        );

        for spec in specs {
            let path = self.final_path(spec);
            let outcome = match self.resolve(spec, &path, cache_mounted).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        repo_id = %spec.repo_id,
                        file = %spec.remote_file,
                        error = %e,
                        "Failed to provision model",
                    );
                    ProvisionOutcome::Failed(e.to_string())
                }
            };
            report.entries.push(ProvisionEntry {
                spec: spec.clone(),
                path,
                outcome,
            });
        }
        report
    }

    fn dest_dir(&self, spec: &ModelSpec) -> PathBuf {
        if spec.target_dir.is_absolute() {
            spec.target_dir.clone()
        } else {
            self.config.base_dir.join(&spec.target_dir)
        }
    }

    fn final_path(&self, spec: &ModelSpec) -> PathBuf {
        self.dest_dir(spec).join(spec.final_name())
    }

    async fn resolve(
        &self,
        spec: &ModelSpec,
        final_path: &Path,
        cache_mounted: bool,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        if tokio::fs::try_exists(final_path).await.unwrap_or(false) {
            tracing::info!(path = %final_path.display(), "Model already present");
            return Ok(ProvisionOutcome::AlreadyPresent);
        }

        let dest_dir = self.dest_dir(spec);
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(io_err(&dest_dir))?;

        if cache_mounted {
            if let Some(cached) = self.find_in_cache(spec).await {
                // A dangling link from an earlier run would block the new one.
                let _ = tokio::fs::remove_file(final_path).await;
                tokio::fs::symlink(&cached, final_path)
                    .await
                    .map_err(io_err(final_path))?;
                tracing::info!(
                    source = %cached.display(),
                    path = %final_path.display(),
                    "Linked model from shared cache",
                );
                return Ok(ProvisionOutcome::Linked { source: cached });
            }
        }

        let fetched = self
            .fetcher
            .fetch(&spec.repo_id, &spec.remote_file, final_path)
            .await?;
        reconcile(&fetched, final_path, &dest_dir).await?;
        tracing::info!(path = %final_path.display(), "Model downloaded");
        Ok(ProvisionOutcome::Downloaded)
    }

    /// Look for `snapshots/*/{remote_file}` under the repo's cache folder
    /// and return the real file behind it.
    async fn find_in_cache(&self, spec: &ModelSpec) -> Option<PathBuf> {
        let relative = safe_relative(&spec.remote_file).ok()?;
        let snapshots = self
            .config
            .cache_dir
            .join(cache_folder_name(&spec.repo_id))
            .join("snapshots");

        let mut entries = tokio::fs::read_dir(&snapshots).await.ok()?;
        let mut revisions = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            revisions.push(entry.path());
        }
        revisions.sort();

        for revision in revisions {
            let candidate = revision.join(relative);
            if let Ok(real) = tokio::fs::canonicalize(&candidate).await {
                return Some(real);
            }
        }
        tracing::debug!(repo_id = %spec.repo_id, file = %spec.remote_file, "Not in shared cache");
        None
    }
}

/// Move a fetched file to its final name and prune directories the
/// fetch created below `dest_dir` if they are now empty.
async fn reconcile(fetched: &Path, final_path: &Path, dest_dir: &Path) -> Result<(), ProvisionError> {
    if fetched == final_path {
        return Ok(());
    }
    tokio::fs::rename(fetched, final_path)
        .await
        .map_err(io_err(final_path))?;

    let mut dir = fetched.parent();
    while let Some(current) = dir {
        if current == dest_dir || !current.starts_with(dest_dir) {
            break;
        }
        if tokio::fs::remove_dir(current).await.is_err() {
            break;
        }
        dir = current.parent();
    }
    Ok(())
}
