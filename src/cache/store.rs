//! On-disk registry of bare mirrors.
//!
//! Layout under the cache root:
//!
//! ```text
//! mirrors/
//!   .create.lock
//!   {host}/{group...}/{name}.mirror/
//!     repo.git/     bare mirror
//!     meta.json     sync metadata
//!     meta.lock     guards meta.json read-modify-write
//!     sync.lock     repository lock, see coordination::locks
//!     read.lock     shared while the mirror is served, exclusive to evict
//! ```
//!
//! Metadata is replaced atomically (temp file + rename), so readers never see
//! a partial write and do not need a lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::cache::identity::RepositoryIdentity;
use crate::coordination::locks::{is_contended, still_linked};
use crate::git::bare_repo;

const META_FILE: &str = "meta.json";
const META_LOCK: &str = "meta.lock";
const SYNC_LOCK: &str = "sync.lock";
const READ_LOCK: &str = "read.lock";
const REPO_DIR: &str = "repo.git";
const CREATE_LOCK: &str = ".create.lock";

/// `last_access` is only rewritten when older than this.
const TOUCH_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Outcome of the most recent sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    Ok,
    Failed { error: String },
}

/// Persisted part of a [`MirrorRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorMeta {
    pub identity: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_result: Option<SyncStatus>,
    pub last_success: Option<DateTime<Utc>>,
    pub sync_started: Option<DateTime<Utc>>,
    pub invalidated_at: Option<DateTime<Utc>>,
    pub last_access: Option<DateTime<Utc>>,
}

/// A mirror as seen at one point in time.
#[derive(Debug, Clone)]
pub struct MirrorRecord {
    pub identity: RepositoryIdentity,
    pub dir: PathBuf,
    pub meta: MirrorMeta,
}

impl MirrorRecord {
    /// The bare repository served to clients.
    pub fn repo_path(&self) -> PathBuf {
        self.dir.join(REPO_DIR)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(SYNC_LOCK)
    }

    /// Fresh iff the last successful sync finished within `max_age` of `now`
    /// and nothing invalidated the mirror since.
    pub fn is_fresh_at(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        let Some(success) = self.meta.last_success else {
            return false;
        };
        if self.meta.invalidated_at.is_some_and(|inv| inv >= success) {
            return false;
        }
        match (now - success).to_std() {
            Ok(age) => age <= max_age,
            // Success recorded in the future (clock skew between workers).
            Err(_) => true,
        }
    }

    /// A sync started after the last recorded completion.
    pub fn in_progress(&self) -> bool {
        match (self.meta.sync_started, self.meta.last_sync) {
            (Some(started), Some(finished)) => started > finished,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Shared hold on a mirror being served.  Released on drop.
#[derive(Debug)]
pub struct MirrorReadGuard {
    _file: File,
}

// ---------------------------------------------------------------------------
// MirrorStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MirrorStore {
    root: PathBuf,
}

impl MirrorStore {
    /// Store rooted at `{cache_root}/mirrors`.
    pub fn new(cache_root: &Path) -> Self {
        Self {
            root: cache_root.join("mirrors"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mirror_dir(&self, identity: &RepositoryIdentity) -> PathBuf {
        self.root.join(identity.relative_dir())
    }

    /// Create the mirrors root and prove it is writable.
    pub async fn ensure_writable(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let marker = self
            .root
            .join(format!(".writable-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&marker, b"ok")
            .await
            .with_context(|| format!("cache root {} is not writable", self.root.display()))?;
        tokio::fs::remove_file(&marker).await.ok();
        Ok(())
    }

    /// Return the record for `identity`, creating an empty one if needed.
    ///
    /// Creation is serialized across processes by a short-lived lock on
    /// `mirrors/.create.lock`; the repository lock is not involved.
    #[instrument(skip(self), fields(repo = %identity))]
    pub async fn get_or_create(&self, identity: &RepositoryIdentity) -> Result<MirrorRecord> {
        let dir = self.mirror_dir(identity);

        if !tokio::fs::try_exists(dir.join(META_FILE)).await.unwrap_or(false) {
            let root = self.root.clone();
            let dir = dir.clone();
            let key = identity.key();
            tokio::task::spawn_blocking(move || create_mirror_dir(&root, &dir, &key))
                .await
                .context("create task panicked")??;
        }

        Ok(self.load(identity, dir).await)
    }

    /// Current record, or `None` if the mirror was never created.
    pub async fn get(&self, identity: &RepositoryIdentity) -> Option<MirrorRecord> {
        let dir = self.mirror_dir(identity);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return None;
        }
        Some(self.load(identity, dir).await)
    }

    async fn load(&self, identity: &RepositoryIdentity, dir: PathBuf) -> MirrorRecord {
        let meta_path = dir.join(META_FILE);
        let mut meta = match tokio::fs::read(&meta_path).await {
            Ok(raw) => match serde_json::from_slice::<MirrorMeta>(&raw) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(repo = %identity, error = %e, "cache corruption: unreadable mirror metadata; treating as never synced");
                    MirrorMeta::default()
                }
            },
            Err(e) => {
                warn!(repo = %identity, error = %e, "cache corruption: mirror metadata missing; treating as never synced");
                MirrorMeta::default()
            }
        };
        meta.identity = identity.key();

        let record = MirrorRecord {
            identity: identity.clone(),
            dir,
            meta,
        };

        if record.meta.last_success.is_some()
            && !bare_repo::validate_bare_repo(&record.repo_path()).await
        {
            warn!(repo = %identity, "cache corruption: mirror recorded as synced but repository is invalid; treating as never synced");
            return MirrorRecord {
                meta: MirrorMeta {
                    last_success: None,
                    ..record.meta
                },
                ..record
            };
        }
        record
    }

    /// Record the outcome of a sync attempt finished at `at`.
    #[instrument(skip(self), fields(repo = %identity))]
    pub async fn mark_synced(
        &self,
        identity: &RepositoryIdentity,
        at: DateTime<Utc>,
        result: SyncStatus,
    ) -> Result<()> {
        self.update_meta(identity, move |meta| {
            meta.last_sync = Some(at);
            if result == SyncStatus::Ok {
                meta.last_success = Some(at);
            }
            meta.last_result = Some(result);
        })
        .await
    }

    pub async fn mark_sync_started(&self, identity: &RepositoryIdentity) -> Result<()> {
        let now = Utc::now();
        self.update_meta(identity, move |meta| meta.sync_started = Some(now))
            .await
    }

    /// Mark the mirror stale regardless of its age.  A mirror that does not
    /// exist is left alone.
    #[instrument(skip(self), fields(repo = %identity))]
    pub async fn invalidate(&self, identity: &RepositoryIdentity) -> Result<()> {
        if !tokio::fs::try_exists(self.mirror_dir(identity)).await.unwrap_or(false) {
            return Ok(());
        }
        let now = Utc::now();
        self.update_meta(identity, move |meta| meta.invalidated_at = Some(now))
            .await?;
        debug!("mirror invalidated");
        Ok(())
    }

    /// Record a client access for eviction ordering.
    pub async fn touch(&self, record: &MirrorRecord) -> Result<()> {
        let now = Utc::now();
        let recent = record
            .meta
            .last_access
            .and_then(|t| (now - t).to_std().ok())
            .is_some_and(|age| age < TOUCH_INTERVAL);
        if recent {
            return Ok(());
        }
        self.update_meta(&record.identity, move |meta| meta.last_access = Some(now))
            .await
    }

    /// Every mirror currently on disk.
    pub async fn list(&self) -> Result<Vec<MirrorRecord>> {
        let root = self.root.clone();
        let found = tokio::task::spawn_blocking(move || scan_mirrors(&root))
            .await
            .context("scan task panicked")?;

        let mut records = Vec::with_capacity(found.len());
        for (dir, meta) in found {
            match RepositoryIdentity::from_key(&meta.identity) {
                Ok(identity) => records.push(MirrorRecord { identity, dir, meta }),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping mirror with unknown identity")
                }
            }
        }
        Ok(records)
    }

    /// Keep `record`'s mirror from being removed while it is served.
    /// `None` when the mirror is gone or being removed.
    pub async fn read_lock(&self, record: &MirrorRecord) -> Result<Option<MirrorReadGuard>> {
        let dir = record.dir.clone();
        tokio::task::spawn_blocking(move || lock_for_reading(&dir))
            .await
            .context("read lock task panicked")?
    }

    /// Delete a mirror directory unless it is being served.  Returns whether
    /// it was removed.  Callers must hold its repository lock.
    #[instrument(skip(self, record), fields(repo = %record.identity))]
    pub async fn remove(&self, record: &MirrorRecord) -> Result<bool> {
        let dir = record.dir.clone();
        tokio::task::spawn_blocking(move || remove_unless_read(&dir))
            .await
            .context("remove task panicked")?
    }

    async fn update_meta<F>(&self, identity: &RepositoryIdentity, apply: F) -> Result<()>
    where
        F: FnOnce(&mut MirrorMeta) + Send + 'static,
    {
        let dir = self.mirror_dir(identity);
        let key = identity.key();
        tokio::task::spawn_blocking(move || update_meta_blocking(&dir, &key, apply))
            .await
            .context("metadata task panicked")?
    }
}

// ---------------------------------------------------------------------------
// Blocking helpers
// ---------------------------------------------------------------------------

fn lock_for_reading(dir: &Path) -> Result<Option<MirrorReadGuard>> {
    let path = dir.join(READ_LOCK);
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to open {}", path.display())),
    };
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to lock {}", path.display())),
    }
    if !still_linked(&file, &path) || !dir.join(REPO_DIR).is_dir() {
        return Ok(None);
    }
    Ok(Some(MirrorReadGuard { _file: file }))
}

/// Move the mirror out of its served path while holding `read.lock`
/// exclusively, then delete it.
fn remove_unless_read(dir: &Path) -> Result<bool> {
    let path = dir.join(READ_LOCK);
    let lock = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e).with_context(|| format!("failed to open {}", path.display())),
    };
    match lock.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("failed to lock {}", path.display())),
    }

    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let trash = dir.with_file_name(format!(".{name}.evicting-{}", uuid::Uuid::new_v4().simple()));
    std::fs::rename(dir, &trash)
        .with_context(|| format!("failed to move {} aside", dir.display()))?;
    drop(lock);
    std::fs::remove_dir_all(&trash)
        .with_context(|| format!("failed to remove {}", trash.display()))?;
    debug!(dir = %dir.display(), "mirror removed");
    Ok(true)
}

fn create_mirror_dir(root: &Path, dir: &Path, key: &str) -> Result<()> {
    std::fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(root.join(CREATE_LOCK))
        .context("failed to open mirror creation lock")?;
    lock.lock_exclusive()
        .context("failed to take mirror creation lock")?;

    let result = init_meta(dir, key);

    FileExt::unlock(&lock).ok();
    result
}

fn init_meta(dir: &Path, key: &str) -> Result<()> {
    if dir.join(META_FILE).exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let meta = MirrorMeta {
        identity: key.to_string(),
        ..MirrorMeta::default()
    };
    write_meta_atomic(dir, &meta)?;
    debug!(repo = %key, dir = %dir.display(), "mirror record created");
    Ok(())
}

fn update_meta_blocking<F>(dir: &Path, key: &str, apply: F) -> Result<()>
where
    F: FnOnce(&mut MirrorMeta),
{
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(META_LOCK))
        .context("failed to open metadata lock")?;
    lock.lock_exclusive().context("failed to take metadata lock")?;

    let mut meta = std::fs::read(dir.join(META_FILE))
        .ok()
        .and_then(|raw| serde_json::from_slice::<MirrorMeta>(&raw).ok())
        .unwrap_or_default();
    meta.identity = key.to_string();
    apply(&mut meta);
    let result = write_meta_atomic(dir, &meta);

    FileExt::unlock(&lock).ok();
    result
}

fn write_meta_atomic(dir: &Path, meta: &MirrorMeta) -> Result<()> {
    let tmp = dir.join(format!(
        ".{META_FILE}.{}.tmp",
        uuid::Uuid::new_v4().simple()
    ));
    let body = serde_json::to_vec_pretty(meta).context("failed to encode mirror metadata")?;
    std::fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, dir.join(META_FILE)).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        anyhow::Error::new(e).context("failed to replace mirror metadata")
    })
}

/// Find every `*.mirror` directory under `root` with readable metadata.
fn scan_mirrors(root: &Path) -> Vec<(PathBuf, MirrorMeta)> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let path = entry.path();
            let is_mirror = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".mirror"));
            if !is_mirror {
                stack.push(path);
                continue;
            }
            match std::fs::read(path.join(META_FILE))
                .ok()
                .and_then(|raw| serde_json::from_slice::<MirrorMeta>(&raw).ok())
            {
                Some(meta) => found.push((path, meta)),
                None => warn!(dir = %path.display(), "mirror without readable metadata"),
            }
        }
    }

    found
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use reqwest::Url;

    use super::*;

    fn identity(path: &str) -> RepositoryIdentity {
        let base = Url::parse("https://git.example.com/").unwrap();
        RepositoryIdentity::from_request_path(&base, path).unwrap()
    }

    fn fake_repo(record: &MirrorRecord) {
        let repo = record.repo_path();
        std::fs::create_dir_all(repo.join("objects")).unwrap();
        std::fs::create_dir_all(repo.join("refs")).unwrap();
        std::fs::write(repo.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path());
        let id = identity("group/repo.git");

        let first = store.get_or_create(&id).await.unwrap();
        let second = store.get_or_create(&id).await.unwrap();
        assert_eq!(first.dir, second.dir);
        assert_eq!(first.meta, second.meta);
        assert!(first.meta.last_sync.is_none());
        assert!(first.dir.ends_with("git.example.com/group/repo.mirror"));
    }

    #[tokio::test]
    async fn concurrent_creation_yields_one_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path());
        let id = identity("group/repo");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move { store.get_or_create(&id).await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn successful_sync_makes_mirror_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path());
        let id = identity("group/repo");
        let record = store.get_or_create(&id).await.unwrap();
        fake_repo(&record);

        let synced_at = Utc::now() - chrono::Duration::seconds(10);
        store.mark_synced(&id, synced_at, SyncStatus::Ok).await.unwrap();

        let record = store.get_or_create(&id).await.unwrap();
        let window = Duration::from_secs(60);
        assert!(record.is_fresh_at(window, Utc::now()));
        assert!(!record.is_fresh_at(Duration::from_secs(5), Utc::now()));
        assert!(!record.is_fresh_at(window, synced_at + chrono::Duration::seconds(61)));
    }

    #[tokio::test]
    async fn failed_sync_keeps_previous_success() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path());
        let id = identity("group/repo");
        let record = store.get_or_create(&id).await.unwrap();
        fake_repo(&record);

        let ok_at = Utc::now() - chrono::Duration::seconds(30);
        store.mark_synced(&id, ok_at, SyncStatus::Ok).await.unwrap();
        let failed = SyncStatus::Failed {
            error: "connection reset".into(),
        };
        store.mark_synced(&id, Utc::now(), failed.clone()).await.unwrap();

        let record = store.get_or_create(&id).await.unwrap();
        assert_eq!(record.meta.last_success, Some(ok_at));
        assert_eq!(record.meta.last_result, Some(failed));
    }

    #[tokio::test]
    async fn invalidation_overrides_age() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path());
        let id = identity("group/repo");
        let record = store.get_or_create(&id).await.unwrap();
        fake_repo(&record);
        store
            .mark_synced(&id, Utc::now() - chrono::Duration::seconds(1), SyncStatus::Ok)
            .await
            .unwrap();

        store.invalidate(&id).await.unwrap();
        let record = store.get_or_create(&id).await.unwrap();
        assert!(!record.is_fresh_at(Duration::from_secs(60), Utc::now()));

        // Invalidating an unknown mirror does not create it.
        store.invalidate(&identity("other/repo")).await.unwrap();
        assert!(store.get(&identity("other/repo")).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_metadata_reads_as_never_synced() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path());
        let id = identity("group/repo");
        let record = store.get_or_create(&id).await.unwrap();
        fake_repo(&record);
        store.mark_synced(&id, Utc::now(), SyncStatus::Ok).await.unwrap();

        std::fs::write(record.dir.join(META_FILE), b"{not json").unwrap();
        let record = store.get_or_create(&id).await.unwrap();
        assert!(record.meta.last_success.is_none());
        assert_eq!(record.meta.identity, id.key());
    }

    #[tokio::test]
    async fn success_without_repository_reads_as_never_synced() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path());
        let id = identity("group/repo");
        store.get_or_create(&id).await.unwrap();
        store.mark_synced(&id, Utc::now(), SyncStatus::Ok).await.unwrap();

        let record = store.get_or_create(&id).await.unwrap();
        assert!(record.meta.last_success.is_none());
        assert!(!record.is_fresh_at(Duration::from_secs(60), Utc::now()));
    }

    #[tokio::test]
    async fn in_progress_tracks_started_and_finished() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path());
        let id = identity("group/repo");
        store.get_or_create(&id).await.unwrap();

        store.mark_sync_started(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().in_progress());

        let finished = Utc::now() + chrono::Duration::milliseconds(5);
        store
            .mark_synced(&id, finished, SyncStatus::Failed { error: "x".into() })
            .await
            .unwrap();
        assert!(!store.get(&id).await.unwrap().in_progress());
    }

    #[tokio::test]
    async fn touch_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path());
        let a = store.get_or_create(&identity("group/a")).await.unwrap();
        store.get_or_create(&identity("group/sub/b")).await.unwrap();

        store.touch(&a).await.unwrap();
        let mut listed = store.list().await.unwrap();
        listed.sort_by(|x, y| x.identity.cmp(&y.identity));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].identity, a.identity);
        assert!(listed[0].meta.last_access.is_some());
        assert!(listed[1].meta.last_access.is_none());

        assert!(store.remove(&listed[0]).await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn served_mirror_is_not_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path());
        let record = store.get_or_create(&identity("group/repo")).await.unwrap();
        fake_repo(&record);

        let reading = store.read_lock(&record).await.unwrap().unwrap();
        let second = store.read_lock(&record).await.unwrap();
        assert!(second.is_some(), "readers share the mirror");
        assert!(!store.remove(&record).await.unwrap());
        assert!(record.repo_path().join("HEAD").exists());

        drop(reading);
        drop(second);
        assert!(store.remove(&record).await.unwrap());
        assert!(!record.dir.exists());
        assert!(store.read_lock(&record).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mirror_without_repository_cannot_be_read_locked() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path());
        let record = store.get_or_create(&identity("group/repo")).await.unwrap();
        assert!(store.read_lock(&record).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ensure_writable_creates_root() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(&tmp.path().join("nested"));
        store.ensure_writable().await.unwrap();
        assert!(store.root().is_dir());
    }
}
