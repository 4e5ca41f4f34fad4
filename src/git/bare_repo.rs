//! On-disk checks for the bare repositories backing each mirror.
//!
//! A mirror directory is only trusted when it still looks like a bare
//! repository; anything else is treated as corruption and recloned.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Check whether `path` looks like a usable bare Git repository.
///
/// Requires a `HEAD` file plus `objects/` and `refs/` directories.  This is a
/// cheap structural check, not `git fsck`.
#[instrument(fields(path = %path.display()))]
pub async fn validate_bare_repo(path: &Path) -> bool {
    if !is_dir(path).await {
        debug!("mirror repository does not exist");
        return false;
    }

    let head_ok = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    let objects_ok = is_dir(&path.join("objects")).await;
    let refs_ok = is_dir(&path.join("refs")).await;

    if !(head_ok && objects_ok && refs_ok) {
        warn!(head_ok, objects_ok, refs_ok, "mirror repository is incomplete");
        return false;
    }
    true
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Remove
// ---------------------------------------------------------------------------

/// Recursively remove `path`.  Missing paths are a no-op.
#[instrument(fields(path = %path.display()))]
pub async fn remove_repo(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!("removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

// ---------------------------------------------------------------------------
// Size
// ---------------------------------------------------------------------------

/// Total size in bytes of the regular files under `path`.
///
/// Symlinks are not followed.  The walk runs on the blocking pool.
pub async fn repo_size_bytes(path: &Path) -> Result<u64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || dir_size_sync(&path))
        .await
        .context("blocking task panicked")
}

fn dir_size_sync(dir: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %current.display(), error = %err, "failed to read directory");
                }
                continue;
            }
        };

        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }

    total
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
