//! Normalized repository keys.
//!
//! Every URL spelling of the same upstream repository must map to one mirror:
//! `https://HOST/group/repo.git`, `https://host/group/repo` and
//! `https://host/group/repo/` are the same repository.

use std::fmt;
use std::path::PathBuf;

use reqwest::Url;

/// Suffix of the directory holding one mirror.
const MIRROR_SUFFIX: &str = ".mirror";

/// Host used for URLs without one (`file://`).
const LOCAL_HOST: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("repository path is empty")]
    Empty,
    #[error("invalid repository path segment: {0:?}")]
    InvalidSegment(String),
    #[error("invalid repository URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryIdentity {
    host: String,
    path: String,
}

impl RepositoryIdentity {
    /// Normalize an upstream URL.
    ///
    /// The scheme and userinfo are ignored, the host is lowercased (a
    /// non-default port is kept), empty path segments and a trailing `.git`
    /// are dropped.
    pub fn from_url(url: &Url) -> Result<Self, IdentityError> {
        let host = match url.host_str() {
            Some(h) if !h.is_empty() => {
                let h = h.to_ascii_lowercase();
                match url.port() {
                    Some(port) => format!("{h}:{port}"),
                    None => h,
                }
            }
            _ => LOCAL_HOST.to_string(),
        };

        let mut segments: Vec<&str> = url.path().split('/').filter(|s| !s.is_empty()).collect();
        if let Some(last) = segments.pop() {
            let last = last.strip_suffix(".git").unwrap_or(last);
            if !last.is_empty() {
                segments.push(last);
            }
        }
        if segments.is_empty() {
            return Err(IdentityError::Empty);
        }
        for segment in &segments {
            check_segment(segment)?;
        }

        Ok(Self {
            host,
            path: segments.join("/"),
        })
    }

    /// Resolve a request path (e.g. `group/repo.git`) against the upstream
    /// base URL and normalize the result.
    pub fn from_request_path(base: &Url, repo_path: &str) -> Result<Self, IdentityError> {
        let trimmed = repo_path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                continue;
            }
            check_segment(segment.strip_suffix(".git").unwrap_or(segment))?;
        }

        let mut base = base.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let url = base
            .join(trimmed)
            .map_err(|e| IdentityError::InvalidUrl(e.to_string()))?;
        Self::from_url(&url)
    }

    /// Inverse of [`key`](Self::key), used when scanning the cache.
    pub fn from_key(key: &str) -> Result<Self, IdentityError> {
        let (host, path) = key.split_once('/').ok_or(IdentityError::Empty)?;
        if host.is_empty() || path.is_empty() {
            return Err(IdentityError::Empty);
        }
        for segment in path.split('/') {
            check_segment(segment)?;
        }
        Ok(Self {
            host: host.to_string(),
            path: path.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host/path`, unique per repository.
    pub fn key(&self) -> String {
        format!("{}/{}", self.host, self.path)
    }

    /// Directory of this mirror relative to the mirrors root.
    pub fn relative_dir(&self) -> PathBuf {
        let mut dir = PathBuf::from(self.host.replace(':', "_"));
        let mut segments = self.path.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                dir.push(segment);
            } else {
                dir.push(format!("{segment}{MIRROR_SUFFIX}"));
            }
        }
        dir
    }

    /// URL of this repository on the upstream `base`.
    pub fn upstream_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        url.set_path(&format!("/{}.git", self.path));
        url.set_query(None);
        url.set_fragment(None);
        url
    }
}

impl fmt::Display for RepositoryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.path)
    }
}

fn check_segment(segment: &str) -> Result<(), IdentityError> {
    let invalid = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['\\', '\0'])
        || segment.ends_with(MIRROR_SUFFIX);
    if invalid {
        Err(IdentityError::InvalidSegment(segment.to_string()))
    } else {
        Ok(())
    }
}
