use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Url;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{MirrorStore, RepositoryIdentity, SyncStatus};
use crate::config::SyncConfig;
use crate::credentials::Credentials;
use crate::git::{self, GitOutput, UpstreamGit};
use crate::metrics::{Metrics, SyncKind, SyncKindLabels, SyncLabels, SyncOutcome};
use crate::sync::{MirrorSync, PermanentKind, SyncError, SyncReport};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_start: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure: `backoff_start * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_start
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }

    /// Longest a full sync can take: every attempt timing out, plus the
    /// backoff between them.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff = (1..attempts).fold(Duration::ZERO, |total, attempt| {
            total.saturating_add(self.backoff(attempt))
        });
        self.attempt_timeout
            .saturating_mul(attempts)
            .saturating_add(backoff)
    }
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_start: Duration::from_millis(config.backoff_start_ms),
            attempt_timeout: Duration::from_secs(config.attempt_timeout),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

enum AttemptError {
    Transient { reason: String, timed_out: bool },
    Permanent { kind: PermanentKind, reason: String },
    Internal(String),
}

/// Map git's stderr to a permanent failure kind, if it describes one.
/// Everything else is worth retrying.
fn classify_failure(stderr: &str) -> Option<PermanentKind> {
    const UNAUTHORIZED: &[&str] = &[
        "authentication failed",
        "http basic: access denied",
        "could not read username",
        "could not read password",
        "returned error: 401",
    ];
    const FORBIDDEN: &[&str] = &["returned error: 403"];
    const NOT_FOUND: &[&str] = &[
        "repository not found",
        "returned error: 404",
        "does not appear to be a git repository",
    ];

    let lower = stderr.to_ascii_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(UNAUTHORIZED) {
        Some(PermanentKind::Unauthorized)
    } else if matches(FORBIDDEN) {
        Some(PermanentKind::Forbidden)
    } else if matches(NOT_FOUND) {
        Some(PermanentKind::NotFound)
    } else {
        None
    }
}

/// Last non-empty stderr line, which is where git puts the fatal error.
fn failure_reason(output: &GitOutput) -> String {
    output
        .stderr
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| format!("git exited with status {:?}", output.code))
}

// ---------------------------------------------------------------------------
// UpstreamSync
// ---------------------------------------------------------------------------

/// Clones or fetches mirrors from the upstream git server.
pub struct UpstreamSync {
    git: Arc<dyn UpstreamGit>,
    store: Arc<MirrorStore>,
    upstream_base: Url,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl UpstreamSync {
    pub fn new(
        git: Arc<dyn UpstreamGit>,
        store: Arc<MirrorStore>,
        upstream_base: Url,
        policy: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            git,
            store,
            upstream_base,
            policy,
            metrics,
        }
    }

    async fn attempt(
        &self,
        kind: SyncKind,
        url: &str,
        repo_path: &Path,
    ) -> Result<GitOutput, AttemptError> {
        let run = async {
            match kind {
                SyncKind::Clone => self.clone_into(url, repo_path).await,
                SyncKind::Fetch => self.git.fetch_mirror(repo_path, url).await,
            }
        };

        let output = match tokio::time::timeout(self.policy.attempt_timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(AttemptError::Internal(format!("{e:#}"))),
            Err(_) => {
                // The abandoned clone never reached its own cleanup.
                if matches!(kind, SyncKind::Clone) {
                    sweep_staging(repo_path).await;
                }
                return Err(AttemptError::Transient {
                    reason: format!("git timed out after {:?}", self.policy.attempt_timeout),
                    timed_out: true,
                })
            }
        };

        if output.success {
            return Ok(output);
        }
        let reason = failure_reason(&output);
        match classify_failure(&output.stderr) {
            Some(kind) => Err(AttemptError::Permanent { kind, reason }),
            None => Err(AttemptError::Transient {
                reason,
                timed_out: false,
            }),
        }
    }

    /// Clone next to the final location and move into place, so the served
    /// path only ever holds a complete repository.
    async fn clone_into(&self, url: &str, repo_path: &Path) -> anyhow::Result<GitOutput> {
        if tokio::fs::try_exists(repo_path).await.unwrap_or(false) {
            warn!(path = %repo_path.display(), "cache corruption: removing invalid mirror repository before reclone");
            git::remove_repo(repo_path).await?;
        }
        sweep_staging(repo_path).await;

        let staging = staging_path(repo_path);
        let output = self.git.clone_mirror(url, &staging).await;
        let output = match output {
            Ok(output) if output.success => output,
            other => {
                git::remove_repo(&staging).await.ok();
                return other;
            }
        };

        if let Err(e) = tokio::fs::rename(&staging, repo_path).await {
            git::remove_repo(&staging).await.ok();
            return Err(anyhow::Error::new(e).context("failed to move cloned mirror into place"));
        }
        Ok(output)
    }

    fn record_attempt(&self, kind: &SyncKind, outcome: SyncOutcome) {
        self.metrics
            .sync_attempts
            .get_or_create(&SyncLabels {
                kind: kind.clone(),
                outcome,
            })
            .inc();
    }
}

fn staging_prefix(repo_path: &Path) -> String {
    let name = repo_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo.git".to_string());
    format!(".{name}.clone-")
}

fn staging_path(repo_path: &Path) -> PathBuf {
    repo_path.with_file_name(format!(
        "{}{}",
        staging_prefix(repo_path),
        uuid::Uuid::new_v4().simple()
    ))
}

/// Remove clone staging directories left next to `repo_path`.  Callers hold
/// the repository's sync lock, so none of them belongs to a live clone.
async fn sweep_staging(repo_path: &Path) {
    let Some(parent) = repo_path.parent() else {
        return;
    };
    let prefix = staging_prefix(repo_path);
    let mut entries = match tokio::fs::read_dir(parent).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %parent.display(), error = %e, "cannot list clone staging directories");
            return;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let path = entry.path();
        match git::remove_repo(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed abandoned clone staging"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove clone staging"),
        }
    }
}

#[async_trait::async_trait]
impl MirrorSync for UpstreamSync {
    #[instrument(skip(self, credentials), fields(repo = %identity))]
    async fn sync(
        &self,
        identity: &RepositoryIdentity,
        repo_path: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let upstream = identity.upstream_url(&self.upstream_base);
        let url = match credentials {
            Some(creds) => creds.authenticated_url(&upstream),
            None => upstream,
        };
        let url = url.as_str();

        let mut attempts = 0;
        let mut kind = SyncKind::Fetch;
        let result = loop {
            attempts += 1;
            kind = if git::validate_bare_repo(repo_path).await {
                SyncKind::Fetch
            } else {
                SyncKind::Clone
            };
            debug!(attempt = attempts, ?kind, "syncing mirror");

            match self.attempt(kind.clone(), url, repo_path).await {
                Ok(output) => {
                    self.record_attempt(&kind, SyncOutcome::Ok);
                    break Ok(SyncReport {
                        kind: kind.clone(),
                        attempts,
                        duration: started.elapsed(),
                        refs_updated: output.refs_updated(),
                        bytes_received: output.bytes_received(),
                    });
                }
                Err(AttemptError::Permanent { kind: failure, reason }) => {
                    self.record_attempt(&kind, SyncOutcome::Permanent);
                    warn!(%failure, %reason, "upstream refused sync; not retrying");
                    break Err(SyncError::Permanent {
                        kind: failure,
                        reason,
                    });
                }
                Err(AttemptError::Transient { reason, timed_out }) => {
                    let outcome = if timed_out {
                        SyncOutcome::Timeout
                    } else {
                        SyncOutcome::Transient
                    };
                    self.record_attempt(&kind, outcome);

                    if attempts >= self.policy.max_attempts {
                        error!(attempts, %reason, "upstream sync failed; giving up");
                        break Err(SyncError::Transient {
                            attempts,
                            reason,
                            timed_out,
                        });
                    }
                    let delay = self.policy.backoff(attempts);
                    warn!(attempt = attempts, ?delay, %reason, "upstream sync failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Internal(reason)) => {
                    error!(%reason, "sync could not run git");
                    break Err(SyncError::Internal(reason));
                }
            }
        };

        self.metrics
            .sync_duration_seconds
            .get_or_create(&SyncKindLabels { kind: kind.clone() })
            .observe(started.elapsed().as_secs_f64());

        let status = match &result {
            Ok(_) => SyncStatus::Ok,
            Err(e) => SyncStatus::Failed {
                error: e.to_string(),
            },
        };
        if let Err(e) = self.store.mark_synced(identity, Utc::now(), status).await {
            error!(error = %e, "failed to record sync outcome");
            if result.is_ok() {
                return Err(SyncError::internal(e));
            }
        }

        if let Ok(report) = &result {
            self.metrics
                .upstream_received_bytes
                .observe(report.bytes_received as f64);
            info!(
                kind = ?report.kind,
                attempts = report.attempts,
                duration_ms = report.duration.as_millis() as u64,
                refs_updated = report.refs_updated,
                bytes_received = report.bytes_received,
                "mirror synced"
            );
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::metrics::MetricsRegistry;

    enum Step {
        Succeed,
        Fail(&'static str),
        Hang,
    }

    /// Scripted stand-in for git.  A successful clone lays out a minimal bare
    /// repository so later attempts see a valid mirror.
    struct ScriptedGit {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
    }

    impl ScriptedGit {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn run(&self, dest: Option<&Path>) -> anyhow::Result<GitOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().pop_front().unwrap_or(Step::Succeed);
            match step {
                Step::Succeed => {
                    if let Some(dest) = dest {
                        std::fs::create_dir_all(dest.join("objects"))?;
                        std::fs::create_dir_all(dest.join("refs"))?;
                        std::fs::write(dest.join("HEAD"), "ref: refs/heads/main\n")?;
                    }
                    Ok(output(true, "Receiving objects: 100% (3/3), 2.00 KiB | 1 MiB/s, done.\n"))
                }
                Step::Fail(stderr) => Ok(output(false, stderr)),
                Step::Hang => {
                    if let Some(dest) = dest {
                        std::fs::create_dir_all(dest.join("objects/pack"))?;
                        std::fs::write(dest.join("objects/pack/tmp_pack_XXXX"), b"PACK")?;
                    }
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
            }
        }
    }

    fn output(success: bool, stderr: &str) -> GitOutput {
        GitOutput {
            success,
            code: Some(if success { 0 } else { 128 }),
            stderr: stderr.to_string(),
        }
    }

    #[async_trait::async_trait]
    impl UpstreamGit for ScriptedGit {
        async fn clone_mirror(&self, _url: &str, dest: &Path) -> anyhow::Result<GitOutput> {
            self.run(Some(dest)).await
        }

        async fn fetch_mirror(&self, _repo: &Path, _url: &str) -> anyhow::Result<GitOutput> {
            self.run(None).await
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: Arc<MirrorStore>,
        identity: RepositoryIdentity,
        repo_path: PathBuf,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MirrorStore::new(tmp.path()));
        let base = Url::parse("https://git.example.com/").unwrap();
        let identity = RepositoryIdentity::from_request_path(&base, "group/repo").unwrap();
        let record = store.get_or_create(&identity).await.unwrap();
        Fixture {
            repo_path: record.repo_path(),
            _tmp: tmp,
            store,
            identity,
        }
    }

    fn syncer(git: Arc<ScriptedGit>, store: Arc<MirrorStore>, attempts: u32) -> UpstreamSync {
        UpstreamSync::new(
            git,
            store,
            Url::parse("https://git.example.com/").unwrap(),
            RetryPolicy {
                max_attempts: attempts,
                backoff_start: Duration::from_millis(1),
                attempt_timeout: Duration::from_millis(200),
            },
            MetricsRegistry::new().metrics,
        )
    }

    #[test]
    fn classification() {
        use PermanentKind::*;
        let cases = [
            ("fatal: Authentication failed for 'https://host/r.git/'", Some(Unauthorized)),
            ("remote: HTTP Basic: Access denied", Some(Unauthorized)),
            ("fatal: could not read Username for 'https://host': terminal prompts disabled", Some(Unauthorized)),
            ("fatal: unable to access 'https://host/r.git/': The requested URL returned error: 403", Some(Forbidden)),
            ("remote: Repository not found.", Some(NotFound)),
            ("fatal: '/srv/x.git' does not appear to be a git repository", Some(NotFound)),
            ("fatal: unable to access 'https://host/': Could not resolve host: host", None),
            ("error: RPC failed; curl 56 Recv failure: Connection reset by peer", None),
            ("The requested URL returned error: 502", None),
        ];
        for (stderr, expected) in cases {
            assert_eq!(classify_failure(stderr), expected, "{stderr}");
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_start: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(4), Duration::from_millis(4000));
    }

    #[test]
    fn worst_case_counts_every_timeout_and_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_start: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(900),
        };
        // 5 x 900s + 0.5 + 1 + 2 + 4
        assert_eq!(policy.worst_case(), Duration::from_millis(4_507_500));
    }

    #[tokio::test]
    async fn missing_mirror_is_cloned_and_recorded() {
        let fx = fixture().await;
        let git = ScriptedGit::new(vec![]);
        let sync = syncer(Arc::clone(&git), Arc::clone(&fx.store), 3);

        let report = sync.sync(&fx.identity, &fx.repo_path, None).await.unwrap();
        assert_eq!(report.kind, SyncKind::Clone);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.bytes_received, 2048);
        assert!(git::validate_bare_repo(&fx.repo_path).await);

        let record = fx.store.get(&fx.identity).await.unwrap();
        assert_eq!(record.meta.last_result, Some(SyncStatus::Ok));
        assert!(record.meta.last_success.is_some());

        // Second sync fetches into the existing mirror.
        let report = sync.sync(&fx.identity, &fx.repo_path, None).await.unwrap();
        assert_eq!(report.kind, SyncKind::Fetch);
        assert_eq!(git.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let fx = fixture().await;
        let git = ScriptedGit::new(vec![Step::Fail("remote: Repository not found.")]);
        let sync = syncer(Arc::clone(&git), Arc::clone(&fx.store), 5);

        let err = sync.sync(&fx.identity, &fx.repo_path, None).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Permanent {
                kind: PermanentKind::NotFound,
                ..
            }
        ));
        assert_eq!(git.calls(), 1);

        let record = fx.store.get(&fx.identity).await.unwrap();
        assert!(matches!(record.meta.last_result, Some(SyncStatus::Failed { .. })));
        assert!(record.meta.last_success.is_none());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_up_to_the_limit() {
        let fx = fixture().await;
        let git = ScriptedGit::new(vec![
            Step::Fail("fatal: Connection reset"),
            Step::Fail("fatal: Connection reset"),
            Step::Fail("fatal: Connection reset"),
            Step::Fail("fatal: Connection reset"),
        ]);
        let sync = syncer(Arc::clone(&git), Arc::clone(&fx.store), 3);

        let err = sync.sync(&fx.identity, &fx.repo_path, None).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::Transient {
                attempts: 3,
                reason: "fatal: Connection reset".to_string(),
                timed_out: false,
            }
        );
        assert_eq!(git.calls(), 3);
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let fx = fixture().await;
        let git = ScriptedGit::new(vec![Step::Fail("fatal: early EOF"), Step::Succeed]);
        let sync = syncer(Arc::clone(&git), Arc::clone(&fx.store), 3);

        let report = sync.sync(&fx.identity, &fx.repo_path, None).await.unwrap();
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test]
    async fn hung_attempt_times_out_as_transient() {
        let fx = fixture().await;
        let git = ScriptedGit::new(vec![Step::Hang, Step::Hang]);
        let sync = syncer(Arc::clone(&git), Arc::clone(&fx.store), 2);

        let err = sync.sync(&fx.identity, &fx.repo_path, None).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Transient {
                attempts: 2,
                timed_out: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn timed_out_clones_leave_no_staging_behind() {
        let fx = fixture().await;
        let git = ScriptedGit::new(vec![Step::Hang, Step::Hang, Step::Hang]);
        let sync = syncer(Arc::clone(&git), Arc::clone(&fx.store), 3);

        sync.sync(&fx.identity, &fx.repo_path, None).await.unwrap_err();
        assert_eq!(git.calls(), 3);

        let prefix = staging_prefix(&fx.repo_path);
        let leftovers: Vec<_> = std::fs::read_dir(fx.repo_path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .collect();
        assert!(leftovers.is_empty(), "staging left behind: {leftovers:?}");
        assert!(!fx.repo_path.exists());
    }

    #[tokio::test]
    async fn clone_sweeps_staging_from_an_earlier_crash() {
        let fx = fixture().await;
        let stale = fx.repo_path.with_file_name(format!("{}deadbeef", staging_prefix(&fx.repo_path)));
        std::fs::create_dir_all(stale.join("objects")).unwrap();

        let git = ScriptedGit::new(vec![]);
        let sync = syncer(Arc::clone(&git), Arc::clone(&fx.store), 1);
        sync.sync(&fx.identity, &fx.repo_path, None).await.unwrap();

        assert!(!stale.exists());
        assert!(git::validate_bare_repo(&fx.repo_path).await);
    }

    #[tokio::test]
    async fn corrupt_mirror_is_recloned() {
        let fx = fixture().await;
        std::fs::create_dir_all(&fx.repo_path).unwrap();
        std::fs::write(fx.repo_path.join("garbage"), "x").unwrap();

        let git = ScriptedGit::new(vec![]);
        let sync = syncer(Arc::clone(&git), Arc::clone(&fx.store), 1);
        let report = sync.sync(&fx.identity, &fx.repo_path, None).await.unwrap();

        assert_eq!(report.kind, SyncKind::Clone);
        assert!(!fx.repo_path.join("garbage").exists());
        assert!(git::validate_bare_repo(&fx.repo_path).await);
    }

    // -- real git ----------------------------------------------------------

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn sh_git(dir: &Path, args: &[&str]) -> String {
        let out = std::process::Command::new("git")
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(["-c", "init.defaultBranch=main"])
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&out.stderr));
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    #[tokio::test]
    async fn push_then_refresh_serves_new_content() {
        if !git_available() {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let upstream_root = tmp.path().join("upstream");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::create_dir_all(&upstream_root).unwrap();

        sh_git(&work, &["init"]);
        sh_git(&work, &["commit", "--allow-empty", "-m", "first"]);
        sh_git(
            tmp.path(),
            &["clone", "--bare", "work", "upstream/project.git"],
        );
        sh_git(&work, &["remote", "add", "origin", "../upstream/project.git"]);

        let store = Arc::new(MirrorStore::new(&tmp.path().join("cache")));
        let base = Url::from_directory_path(&upstream_root).unwrap();
        let identity = RepositoryIdentity::from_request_path(&base, "project.git").unwrap();
        let record = store.get_or_create(&identity).await.unwrap();

        let git = Arc::new(git::Git::new(&crate::config::GitConfig::default()));
        let sync = UpstreamSync::new(
            git,
            Arc::clone(&store),
            base,
            RetryPolicy {
                max_attempts: 1,
                backoff_start: Duration::from_millis(1),
                attempt_timeout: Duration::from_secs(60),
            },
            MetricsRegistry::new().metrics,
        );

        let report = sync.sync(&identity, &record.repo_path(), None).await.unwrap();
        assert_eq!(report.kind, SyncKind::Clone);

        sh_git(&work, &["commit", "--allow-empty", "-m", "second"]);
        sh_git(&work, &["push", "origin", "HEAD:refs/heads/main"]);
        let pushed = sh_git(&work, &["rev-parse", "HEAD"]);

        store.invalidate(&identity).await.unwrap();
        let stale = store.get(&identity).await.unwrap();
        assert!(!stale.is_fresh_at(Duration::from_secs(60), Utc::now()));

        let report = sync.sync(&identity, &record.repo_path(), None).await.unwrap();
        assert_eq!(report.kind, SyncKind::Fetch);
        let mirrored = sh_git(&record.repo_path(), &["rev-parse", "refs/heads/main"]);
        assert_eq!(mirrored, pushed);
    }
}
