//! Cross-process repository lock.
//!
//! Each mirror has a `sync.lock` file.  Holding an exclusive advisory lock on
//! it grants the right to mutate the mirror.  The holder records who it is in
//! the file and refreshes that record with a heartbeat while it holds the
//! lock.  Waiters take over a lock whose holder process is gone, or whose
//! heartbeat is older than `stale_after` (a wedged process).  Advisory locks
//! are dropped by the kernel when their process dies, so a crashed holder
//! never blocks anyone.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::coordination::node;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for {path}")]
    Timeout { path: String, waited: Duration },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Owner record
// ---------------------------------------------------------------------------

/// Written into the lock file by the current holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockOwner {
    owner: String,
    pid: u32,
    hostname: String,
    /// Unix timestamps (milliseconds).
    acquired_at_ms: i64,
    #[serde(default)]
    heartbeat_at_ms: i64,
}

impl LockOwner {
    fn current() -> Self {
        let now = now_ms();
        Self {
            owner: node::node_id().to_string(),
            pid: std::process::id(),
            hostname: node::hostname(),
            acquired_at_ms: now,
            heartbeat_at_ms: now,
        }
    }

    fn last_seen_ms(&self) -> i64 {
        self.acquired_at_ms.max(self.heartbeat_at_ms)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// RepoLock
// ---------------------------------------------------------------------------

/// Timing knobs of a [`RepoLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeouts {
    pub acquire: Duration,
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

impl From<&LockConfig> for LockTimeouts {
    fn from(config: &LockConfig) -> Self {
        Self {
            acquire: Duration::from_secs(config.acquire_timeout),
            stale_after: Duration::from_secs(config.stale_after),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// Lock on a single mirror, identified by its lock file path.
#[derive(Debug, Clone)]
pub struct RepoLock {
    path: PathBuf,
    timeouts: LockTimeouts,
}

/// Proof of holding a [`RepoLock`].  Keeps the owner record's heartbeat
/// fresh and releases on drop.
#[derive(Debug)]
pub struct RepoLockGuard {
    file: Arc<Mutex<Option<File>>>,
    heartbeat: JoinHandle<()>,
    path: PathBuf,
    acquired: Instant,
    reclaimed: bool,
}

enum Attempt {
    Acquired {
        file: File,
        owner: LockOwner,
        reclaimed: bool,
    },
    Busy,
}

impl RepoLock {
    pub fn new(path: impl Into<PathBuf>, timeouts: LockTimeouts) -> Self {
        Self {
            path: path.into(),
            timeouts,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the lock, polling until the acquire timeout elapses.
    ///
    /// The wait backs off from 10ms up to the poll interval.
    pub async fn acquire(&self) -> Result<RepoLockGuard, LockError> {
        let start = Instant::now();
        let deadline = start + self.timeouts.acquire;
        let mut delay = Duration::from_millis(10).min(self.timeouts.poll_interval);
        let mut contended = false;

        loop {
            if let Some(guard) = self.attempt().await? {
                debug!(
                    path = %self.path.display(),
                    waited_ms = start.elapsed().as_millis() as u64,
                    contended,
                    "repository lock acquired"
                );
                return Ok(guard);
            }
            contended = true;

            let now = Instant::now();
            if now >= deadline {
                let waited = start.elapsed();
                warn!(
                    path = %self.path.display(),
                    ?waited,
                    "timed out waiting for repository lock"
                );
                return Err(LockError::Timeout {
                    path: self.path.display().to_string(),
                    waited,
                });
            }

            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.timeouts.poll_interval);
        }
    }

    /// Take the lock only if nobody holds it.
    pub async fn try_acquire(&self) -> Result<Option<RepoLockGuard>, LockError> {
        self.attempt().await
    }

    async fn attempt(&self) -> Result<Option<RepoLockGuard>, LockError> {
        let path = self.path.clone();
        let stale_after = self.timeouts.stale_after;
        let attempt = tokio::task::spawn_blocking(move || try_lock_once(&path, stale_after))
            .await
            .context("lock task panicked")??;

        Ok(match attempt {
            Attempt::Acquired {
                file,
                owner,
                reclaimed,
            } => {
                let file = Arc::new(Mutex::new(Some(file)));
                let heartbeat = spawn_heartbeat(
                    Arc::clone(&file),
                    owner,
                    heartbeat_interval(self.timeouts.stale_after),
                    self.path.clone(),
                );
                Some(RepoLockGuard {
                    file,
                    heartbeat,
                    path: self.path.clone(),
                    acquired: Instant::now(),
                    reclaimed,
                })
            }
            Attempt::Busy => None,
        })
    }
}

/// Several heartbeats fit in one staleness window.
fn heartbeat_interval(stale_after: Duration) -> Duration {
    (stale_after / 4).max(Duration::from_millis(10))
}

/// Rewrite the owner record every `every` until the guard lets go of `file`.
fn spawn_heartbeat(
    file: Arc<Mutex<Option<File>>>,
    mut owner: LockOwner,
    every: Duration,
    path: PathBuf,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            owner.heartbeat_at_ms = now_ms();
            let record = owner.clone();
            let file = Arc::clone(&file);
            let written = tokio::task::spawn_blocking(move || match file.lock().as_mut() {
                Some(file) => write_owner(file, &record).map(|()| true),
                None => Ok(false),
            })
            .await;
            match written {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => break,
                Ok(Err(e)) => {
                    warn!(path = %path.display(), error = %e, "failed to refresh lock heartbeat")
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "lock heartbeat task failed");
                    break;
                }
            }
        }
    })
}

impl RepoLockGuard {
    /// Whether this guard was obtained by taking over an abandoned lock.
    pub fn reclaimed_stale(&self) -> bool {
        self.reclaimed
    }

    pub fn held_for(&self) -> Duration {
        self.acquired.elapsed()
    }
}

impl Drop for RepoLockGuard {
    fn drop(&mut self) {
        self.heartbeat.abort();
        // Waits out a heartbeat write in progress.
        if let Some(file) = self.file.lock().take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(path = %self.path.display(), error = %e, "failed to unlock repository lock");
            }
            debug!(
                path = %self.path.display(),
                held_ms = self.acquired.elapsed().as_millis() as u64,
                "repository lock released"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking helpers
// ---------------------------------------------------------------------------

fn try_lock_once(path: &Path, stale_after: Duration) -> anyhow::Result<Attempt> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut reclaimed = false;
    // One retry after unlinking a stale lock file, one after losing a race on
    // a replaced file.
    for _ in 0..3 {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                if !still_linked(&file, path) {
                    // The file was unlinked by a reclaiming waiter between our
                    // open and lock.  Try again on the new one.
                    continue;
                }
                let owner = LockOwner::current();
                write_owner(&mut file, &owner)
                    .with_context(|| format!("failed to record lock owner in {}", path.display()))?;
                return Ok(Attempt::Acquired {
                    file,
                    owner,
                    reclaimed,
                });
            }
            Err(e) if is_contended(&e) => {
                if reclaimed {
                    return Ok(Attempt::Busy);
                }
                match stale_reason(&mut file, stale_after) {
                    Some(reason) => {
                        warn!(path = %path.display(), %reason, "reclaiming abandoned repository lock");
                        match std::fs::remove_file(path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => {
                                return Err(e).with_context(|| {
                                    format!("failed to remove stale lock {}", path.display())
                                })
                            }
                        }
                        reclaimed = true;
                    }
                    None => return Ok(Attempt::Busy),
                }
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to lock {}", path.display()));
            }
        }
    }

    Ok(Attempt::Busy)
}

pub(crate) fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Whether `file` is still the file found at `path` (nobody unlinked or
/// replaced it since it was opened).
#[cfg(unix)]
pub(crate) fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.ino() == current.ino() && held.dev() == current.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
pub(crate) fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

fn write_owner(file: &mut File, owner: &LockOwner) -> std::io::Result<()> {
    let owner = serde_json::to_vec(owner)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&owner)?;
    file.flush()
}

/// Why the current holder of `file` should be considered gone, if it should.
fn stale_reason(file: &mut File, stale_after: Duration) -> Option<String> {
    let now = now_ms();

    let mut contents = String::new();
    let owner = file
        .seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_string(&mut contents))
        .ok()
        .and_then(|_| serde_json::from_str::<LockOwner>(&contents).ok());

    match owner {
        Some(owner) => {
            if owner.hostname == node::hostname() && !node::process_alive(owner.pid) {
                return Some(format!("holder pid {} is no longer running", owner.pid));
            }
            let silent_ms = now.saturating_sub(owner.last_seen_ms());
            (silent_ms >= 0 && silent_ms as u128 >= stale_after.as_millis()).then(|| {
                format!("no heartbeat from {} for {silent_ms}ms", owner.owner)
            })
        }
        // The holder may still be writing its record; fall back to the file's
        // modification time.
        None => {
            let modified = file.metadata().ok()?.modified().ok()?;
            let age = modified.elapsed().ok()?;
            (age >= stale_after).then(|| format!("unreadable owner record, {}s old", age.as_secs()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn lock_at(path: &Path, timeout_ms: u64) -> RepoLock {
        RepoLock::new(
            path,
            LockTimeouts {
                acquire: Duration::from_millis(timeout_ms),
                stale_after: Duration::from_secs(3600),
                poll_interval: Duration::from_millis(20),
            },
        )
    }

    #[tokio::test]
    async fn released_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sync.lock");
        let lock = lock_at(&path, 100);

        let guard = lock.acquire().await.unwrap();
        assert!(lock.try_acquire().await.unwrap().is_none());
        drop(guard);
        assert!(lock.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn waiter_times_out_behind_slow_holder() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sync.lock");

        let _holder = lock_at(&path, 100).acquire().await.unwrap();

        let started = Instant::now();
        let err = lock_at(&path, 300).acquire().await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn waiter_gets_lock_once_holder_releases() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sync.lock");

        let holder = lock_at(&path, 100).acquire().await.unwrap();
        let waiter = {
            let path = path.clone();
            tokio::spawn(async move { lock_at(&path, 5_000).acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(holder);

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn holders_are_mutually_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sync.lock");
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let inside = Arc::clone(&inside);
                let entered = Arc::clone(&entered);
                tokio::spawn(async move {
                    let _guard = lock_at(&path, 10_000).acquire().await.unwrap();
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                    entered.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    inside.store(false, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn stale_holder_is_reclaimed_by_age() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sync.lock");

        let hung = lock_at(&path, 100).acquire().await.unwrap();
        // A wedged holder stops heartbeating.
        hung.heartbeat.abort();
        // Pretend the holder took the lock two hours ago and has not been
        // heard from since.
        let two_hours_ago = now_ms() - 7_200_000;
        let old = LockOwner {
            acquired_at_ms: two_hours_ago,
            heartbeat_at_ms: two_hours_ago,
            ..LockOwner::current()
        };
        std::fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();

        let lock = RepoLock::new(
            &path,
            LockTimeouts {
                acquire: Duration::from_secs(2),
                stale_after: Duration::from_secs(60),
                poll_interval: Duration::from_millis(20),
            },
        );
        let guard = lock.acquire().await.unwrap();
        assert!(guard.reclaimed_stale());

        // The new holder owns the file now at the lock path.
        let recorded: LockOwner =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(now_ms() - recorded.acquired_at_ms < 60_000);
    }

    #[tokio::test]
    async fn live_holder_outlasting_the_window_keeps_the_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sync.lock");
        let timeouts = LockTimeouts {
            acquire: Duration::from_millis(300),
            stale_after: Duration::from_secs(1),
            poll_interval: Duration::from_millis(20),
        };

        let holder = RepoLock::new(&path, timeouts).acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        let err = RepoLock::new(&path, timeouts).acquire().await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(RepoLock::new(&path, timeouts).try_acquire().await.unwrap().is_none());

        let recorded: LockOwner =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(recorded.heartbeat_at_ms > recorded.acquired_at_ms);
        assert!(now_ms() - recorded.heartbeat_at_ms < 1_000);

        drop(holder);
        assert!(RepoLock::new(&path, timeouts).try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn leftover_record_of_dead_process_does_not_block() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sync.lock");
        // A crashed holder leaves its record behind, but no advisory lock.
        let dead = LockOwner {
            pid: u32::MAX,
            ..LockOwner::current()
        };
        std::fs::write(&path, serde_json::to_vec(&dead).unwrap()).unwrap();

        let guard = lock_at(&path, 100).acquire().await.unwrap();
        assert!(!guard.reclaimed_stale());
    }

    #[test]
    fn fresh_owner_is_not_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sync.lock");
        std::fs::write(&path, serde_json::to_vec(&LockOwner::current()).unwrap()).unwrap();
        let mut file = File::open(&path).unwrap();
        assert!(stale_reason(&mut file, Duration::from_secs(60)).is_none());
    }

    #[test]
    fn same_host_dead_pid_is_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sync.lock");
        let dead = LockOwner {
            pid: u32::MAX,
            ..LockOwner::current()
        };
        std::fs::write(&path, serde_json::to_vec(&dead).unwrap()).unwrap();
        let mut file = File::open(&path).unwrap();
        assert!(stale_reason(&mut file, Duration::from_secs(3600)).is_some());
    }
}
