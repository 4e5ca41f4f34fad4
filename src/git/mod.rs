//! Git command wrappers and bare repository checks.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution.  Upstream credentials travel inside the URL and
//! are redacted from every log line and captured stderr.

pub mod bare_repo;
pub mod commands;

pub use bare_repo::{remove_repo, repo_size_bytes, validate_bare_repo};
pub use commands::{Git, GitOutput, UpstreamGit};
