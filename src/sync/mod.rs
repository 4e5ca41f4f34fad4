//! Bringing mirrors up to date with upstream.
//!
//! [`UpstreamSync`] runs `git clone --mirror` or `git fetch` against upstream
//! with bounded retries and classifies failures so that the HTTP layer can
//! answer with a meaningful status.

pub mod upstream;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::cache::RepositoryIdentity;
use crate::credentials::Credentials;
use crate::metrics::SyncKind;

pub use upstream::{RetryPolicy, UpstreamSync};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Upstream failures that retrying cannot fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    Unauthorized,
    Forbidden,
    NotFound,
}

impl fmt::Display for PermanentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not found",
        })
    }
}

/// Why a mirror could not be brought up to date.
///
/// `Clone` because one refresh result is handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("upstream unavailable after {attempts} attempt(s): {reason}")]
    Transient {
        attempts: u32,
        reason: String,
        timed_out: bool,
    },
    #[error("upstream refused ({kind}): {reason}")]
    Permanent { kind: PermanentKind, reason: String },
    #[error("timed out after {waited:?} waiting for the repository lock")]
    LockTimeout { waited: Duration },
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn internal(err: impl fmt::Display) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Summary of a successful sync.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub kind: SyncKind,
    pub attempts: u32,
    pub duration: Duration,
    pub refs_updated: usize,
    pub bytes_received: u64,
}

/// Anything that can bring a mirror up to date and record the outcome in the
/// mirror store.
#[async_trait::async_trait]
pub trait MirrorSync: Send + Sync {
    async fn sync(
        &self,
        identity: &RepositoryIdentity,
        repo_path: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<SyncReport, SyncError>;
}
