//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every operation shells out to the configured `git` binary.  The configured
//! `-c key=value` overrides are applied to every invocation and terminal
//! prompts are disabled so that a missing credential fails fast instead of
//! hanging.  Child processes are killed when their handle is dropped.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, instrument};

use crate::config::GitConfig;
use crate::credentials::{redact_text, redact_url};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Result of a git command that talks to upstream.
///
/// A non-zero exit is not an error at this level: callers classify the
/// failure from `stderr`.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// stderr with credentials redacted.
    pub stderr: String,
}

impl GitOutput {
    fn from_parts(status: ExitStatus, stderr: &[u8]) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
            stderr: redact_text(&String::from_utf8_lossy(stderr)),
        }
    }

    /// Number of refs reported as updated.
    pub fn refs_updated(&self) -> usize {
        count_updated_refs(&self.stderr)
    }

    /// Pack bytes received from upstream, from git's progress output.
    pub fn bytes_received(&self) -> u64 {
        parse_received_bytes(&self.stderr)
    }
}

/// The upstream-facing half of git, behind a trait so sync logic can be
/// exercised without a network.
#[async_trait::async_trait]
pub trait UpstreamGit: Send + Sync {
    /// `git clone --mirror <url> <dest>`.
    async fn clone_mirror(&self, url: &str, dest: &Path) -> Result<GitOutput>;

    /// `git fetch --prune --force --tags <url> +refs/*:refs/*` inside `repo`.
    async fn fetch_mirror(&self, repo: &Path, url: &str) -> Result<GitOutput>;
}

// ---------------------------------------------------------------------------
// Git binary
// ---------------------------------------------------------------------------

/// Handle on the configured git binary.
#[derive(Debug, Clone)]
pub struct Git {
    binary: String,
    overrides: Vec<(String, String)>,
}

impl Git {
    pub fn new(config: &GitConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            overrides: config
                .config
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Base command with overrides, prompts disabled and stdio captured.
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        for (key, value) in &self.overrides {
            cmd.arg("-c").arg(format!("{key}={value}"));
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    // -----------------------------------------------------------------------
    // Stateless services (streamed)
    // -----------------------------------------------------------------------

    /// Spawn `git upload-pack --stateless-rpc [--advertise-refs] <repo>`.
    ///
    /// `protocol` is the client's `Git-Protocol` header and is forwarded as
    /// `GIT_PROTOCOL`.  The caller owns stdin/stdout/stderr of the returned
    /// child.
    pub fn spawn_upload_pack(
        &self,
        repo: &Path,
        advertise_refs: bool,
        protocol: Option<&str>,
    ) -> Result<Child> {
        self.spawn_stateless("upload-pack", repo, advertise_refs, protocol)
    }

    /// Spawn `git receive-pack --stateless-rpc [--advertise-refs] <repo>`.
    /// Only used when upstream is a local path.
    pub fn spawn_receive_pack(&self, repo: &Path, advertise_refs: bool) -> Result<Child> {
        self.spawn_stateless("receive-pack", repo, advertise_refs, None)
    }

    #[instrument(skip(self), fields(repo = %repo.display()))]
    fn spawn_stateless(
        &self,
        service: &str,
        repo: &Path,
        advertise_refs: bool,
        protocol: Option<&str>,
    ) -> Result<Child> {
        let mut cmd = self.command();
        cmd.arg(service).arg("--stateless-rpc");
        if advertise_refs {
            cmd.arg("--advertise-refs");
        }
        cmd.arg(repo);

        if let Some(protocol) = protocol {
            cmd.env("GIT_PROTOCOL", protocol);
        }
        cmd.stdin(Stdio::piped());

        debug!(advertise_refs, "spawning git {service}");
        cmd.spawn()
            .with_context(|| format!("failed to spawn git {service}"))
    }

    // -----------------------------------------------------------------------
    // Object lookup
    // -----------------------------------------------------------------------

    /// Return the subset of `oids` that the repository does not contain.
    #[instrument(skip(self, oids), fields(repo = %repo.display(), count = oids.len()))]
    pub async fn missing_objects(&self, repo: &Path, oids: &[String]) -> Result<Vec<String>> {
        if oids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = self.command();
        cmd.arg("-C").arg(repo).arg("cat-file").arg("--batch-check");
        cmd.stdin(Stdio::piped());

        let mut child = cmd.spawn().context("failed to spawn git cat-file")?;

        let input = oids.iter().fold(String::new(), |mut acc, oid| {
            acc.push_str(oid);
            acc.push('\n');
            acc
        });
        let mut stdin = child.stdin.take().context("git cat-file stdin not piped")?;
        let writer = tokio::spawn(async move {
            let res = stdin.write_all(input.as_bytes()).await;
            drop(stdin);
            res
        });

        let output = child
            .wait_with_output()
            .await
            .context("git cat-file failed")?;
        writer
            .await
            .context("cat-file writer panicked")?
            .context("failed to write object ids to git cat-file")?;

        anyhow::ensure!(
            output.status.success(),
            "git cat-file --batch-check failed (status {}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim(),
        );

        let missing = parse_missing(&String::from_utf8_lossy(&output.stdout));
        debug!(missing = missing.len(), "object lookup complete");
        Ok(missing)
    }
}

#[async_trait::async_trait]
impl UpstreamGit for Git {
    #[instrument(skip(self, url), fields(url = %redact_url(url), dest = %dest.display()))]
    async fn clone_mirror(&self, url: &str, dest: &Path) -> Result<GitOutput> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut cmd = self.command();
        cmd.arg("clone")
            .arg("--mirror")
            .arg("--progress")
            .arg(url)
            .arg(dest);

        debug!("spawning git clone --mirror");
        let output = cmd
            .output()
            .await
            .context("failed to spawn git clone --mirror")?;

        Ok(GitOutput::from_parts(output.status, &output.stderr))
    }

    #[instrument(skip(self, url), fields(url = %redact_url(url), repo = %repo.display()))]
    async fn fetch_mirror(&self, repo: &Path, url: &str) -> Result<GitOutput> {
        let mut cmd = self.command();
        cmd.arg("-C")
            .arg(repo)
            .arg("fetch")
            .arg("--prune")
            .arg("--force")
            .arg("--tags")
            .arg("--progress")
            .arg(url)
            .arg("+refs/*:refs/*");

        debug!("spawning git fetch");
        let output = cmd.output().await.context("failed to spawn git fetch")?;

        Ok(GitOutput::from_parts(output.status, &output.stderr))
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Count the number of ref-update lines in `git fetch` stderr.
///
/// Lines matching patterns like ` -> ` or `[new branch]` are counted.
fn count_updated_refs(stderr: &str) -> usize {
    stderr
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.contains("->") && !trimmed.starts_with("From")
        })
        .count()
}

/// Parse the final `Receiving objects: 100% (n/n), 1.20 MiB | ...` progress
/// line.  Returns 0 when git did not report a size.
fn parse_received_bytes(stderr: &str) -> u64 {
    stderr
        .split(['\r', '\n'])
        .filter_map(|line| line.split_once("Receiving objects:").map(|(_, rest)| rest))
        .filter_map(|rest| {
            let (_, amount) = rest.split_once("), ")?;
            let mut tokens = amount.split_whitespace();
            let value: f64 = tokens.next()?.parse().ok()?;
            let scale = match tokens.next()?.trim_end_matches(',') {
                "byte" | "bytes" => 1.0,
                "KiB" => 1024.0,
                "MiB" => 1024.0 * 1024.0,
                "GiB" => 1024.0 * 1024.0 * 1024.0,
                _ => return None,
            };
            Some((value * scale) as u64)
        })
        .last()
        .unwrap_or(0)
}

/// Object ids reported as `<oid> missing` by `git cat-file --batch-check`.
fn parse_missing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_suffix(" missing"))
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
