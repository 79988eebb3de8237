//! Zero-overwrite deletion for scratch files on the execution host.
//!
//! Staged inputs and produced outputs are plaintext copies of a job's
//! data. Before unlinking, each file's full extent is overwritten with
//! zeros and synced, so the bytes do not survive on shared or ephemeral
//! storage. All failures here are logged and swallowed: cleanup is
//! best-effort and must never block job completion.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Size of the zero buffer used for overwriting.
const WIPE_CHUNK_SIZE: usize = 64 * 1024;

/// Overwrite `path` with zeros, sync, then unlink it.
///
/// Symbolic links are unlinked without touching their target. Returns
/// `true` when the path no longer exists afterwards.
pub fn secure_delete(path: &Path) -> bool {
    match try_secure_delete(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Secure delete failed");
            false
        }
    }
}

fn try_secure_delete(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return fs::remove_file(path);
    }

    let len = meta.len();
    let mut file = OpenOptions::new().write(true).open(path)?;
    overwrite_with_zeros(&mut file, len)?;
    file.sync_all()?;
    drop(file);

    fs::remove_file(path)
}

fn overwrite_with_zeros(file: &mut File, len: u64) -> io::Result<()> {
    let zeros = [0u8; WIPE_CHUNK_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(WIPE_CHUNK_SIZE as u64) as usize;
        file.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    file.flush()
}

/// Securely delete every regular file (and symlink) directly inside `dir`.
///
/// Not recursive. A missing directory is a no-op. Returns the number of
/// entries removed.
pub fn clear_directory(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Cannot list directory for cleanup");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if (file_type.is_file() || file_type.is_symlink()) && secure_delete(&entry.path()) {
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "Securely cleared directory");
    }
    removed
}

/// Write `bytes` to `path` and force them to durable storage before
/// returning, so a concurrent reader never observes a partial file.
pub fn write_durable(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()
}
