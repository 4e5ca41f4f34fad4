//! Cache of generated upload-pack responses.
//!
//! Serving a clone from a mirror makes git count and compress the same
//! objects again for every client.  When the answer depends only on the
//! objects a request names, the generated response is kept on disk and
//! replayed for identical requests.
//!
//! ```text
//! packs/
//!   clean.lock
//!   {hash[..2]}/{hash}
//! ```
//!
//! Entries are guarded with `flock`: readers hold a shared lock while they
//! stream an entry, the writer generating it and the cleaner removing it hold
//! an exclusive one.  An entry is complete once it ends in a flush packet;
//! anything else is never served.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use bytes::Bytes;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::process::Child;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::RepositoryIdentity;
use crate::config::PackCacheConfig;
use crate::coordination::locks::{is_contended, still_linked};
use crate::http::pktline::{UploadRequest, FLUSH};
use crate::http::relay::{self, RelayConfig};
use crate::http::session::UPLOAD_PACK;
use crate::metrics::Metrics;

const CLEAN_LOCK: &str = "clean.lock";
/// Poll interval while another writer generates the same entry.
const WRITE_POLL: Duration = Duration::from_millis(50);
/// Output of a failed generation returned to the client.
const FAILED_OUTPUT_CAP: u64 = 64 * 1024;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// SHA-256 over everything that shapes an upload-pack response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackKey(String);

impl PackKey {
    pub fn new(identity: &RepositoryIdentity, protocol_version: u8, request: &UploadRequest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(identity.key().as_bytes());
        hasher.update(format!("\0version={protocol_version}").as_bytes());
        for (label, lines) in [
            ("want", &request.wants),
            ("have", &request.haves),
            ("arg", &request.args),
        ] {
            for line in lines {
                hasher.update(format!("\0{label} {line}").as_bytes());
            }
        }
        Self(hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for PackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// PackCache
// ---------------------------------------------------------------------------

pub struct PackCache {
    root: PathBuf,
    max_bytes: u64,
    metrics: Arc<Metrics>,
}

impl PackCache {
    /// Cache rooted at `{cache_root}/packs`.
    pub fn new(cache_root: &Path, config: &PackCacheConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            root: cache_root.join("packs"),
            max_bytes: config.max_bytes,
            metrics,
        }
    }

    fn entry_path(&self, key: &PackKey) -> PathBuf {
        self.root.join(&key.0[..2]).join(&key.0)
    }

    /// A complete entry, held under a shared lock.  `None` when there is no
    /// complete entry or somebody is writing or removing it.
    pub async fn open(&self, key: &PackKey) -> Result<Option<PackReader>> {
        let path = self.entry_path(key);
        tokio::task::spawn_blocking(move || open_complete(path))
            .await
            .context("pack cache task panicked")?
    }

    /// Take the exclusive lock on an entry, waiting for a concurrent writer
    /// until `deadline`.
    pub async fn lock_for_write(&self, key: &PackKey, deadline: Instant) -> Result<PackWriter> {
        let path = self.entry_path(key);
        loop {
            let attempt = {
                let path = path.clone();
                tokio::task::spawn_blocking(move || try_lock_entry(&path))
                    .await
                    .context("pack cache task panicked")??
            };
            if let Some(file) = attempt {
                return Ok(PackWriter {
                    file,
                    path,
                    key: key.clone(),
                });
            }
            if Instant::now() >= deadline {
                anyhow::bail!("timed out waiting for pack cache entry {key}");
            }
            tokio::time::sleep(WRITE_POLL).await;
        }
    }

    /// Remove least recently used entries until usage fits in `max_bytes`.
    /// Entries in use are skipped.  Only one process cleans at a time.
    #[instrument(skip(self))]
    pub async fn clean(&self) -> Result<CleanReport> {
        let root = self.root.clone();
        let max_bytes = self.max_bytes;
        let metrics = Arc::clone(&self.metrics);
        tokio::task::spawn_blocking(move || clean_blocking(&root, max_bytes, &metrics))
            .await
            .context("pack cache cleaner panicked")?
    }

    /// Clean every `interval` until the task is dropped.
    pub async fn run_clean_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.clean().await {
                error!(error = %e, "pack cache cleaning failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Readers and writers
// ---------------------------------------------------------------------------

/// A complete entry.  Holding it keeps the cleaner away.
#[derive(Debug)]
pub struct PackReader {
    file: File,
    size: u64,
}

impl PackReader {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The entry's bytes.  `self` must outlive the stream.
    pub fn stream(&self, chunk_size: usize) -> Result<ReaderStream<tokio::fs::File>> {
        let mut file = self.file.try_clone().context("failed to reopen pack cache entry")?;
        file.seek(SeekFrom::Start(0))?;
        Ok(ReaderStream::with_capacity(tokio::fs::File::from_std(file), chunk_size))
    }
}

/// Exclusive hold on an entry being generated.
#[derive(Debug)]
pub struct PackWriter {
    file: File,
    path: PathBuf,
    key: PackKey,
}

/// What generating an entry produced.
#[derive(Debug)]
pub enum Filled {
    /// The entry is complete and can be opened.
    Complete { bytes: u64 },
    /// git failed; what it wrote and said, for the client.
    Failed { output: Bytes, stderr: String },
    /// git succeeded but its output cannot be replayed.
    Unusable,
}

impl PackWriter {
    /// Whether another writer completed the entry while this one waited.
    pub fn complete(&mut self) -> bool {
        is_complete(&mut self.file).unwrap_or(false)
    }

    /// Run `child`, an upload-pack over `input`, into the entry.
    pub async fn fill(mut self, child: Child, input: Bytes, config: RelayConfig) -> Result<Filled> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        let sink = tokio::fs::File::from_std(self.file.try_clone()?);
        let captured = relay::capture_child(child, UPLOAD_PACK, input, sink, config).await?;

        if captured.success && is_complete(&mut self.file)? {
            debug!(key = %self.key, bytes = captured.bytes, "pack cached");
            return Ok(Filled::Complete {
                bytes: captured.bytes,
            });
        }

        let filled = if captured.success {
            warn!(key = %self.key, bytes = captured.bytes, "generated pack does not end in a flush packet");
            Filled::Unusable
        } else {
            let mut output = Vec::new();
            self.file.seek(SeekFrom::Start(0))?;
            (&self.file).take(FAILED_OUTPUT_CAP).read_to_end(&mut output)?;
            Filled::Failed {
                output: Bytes::from(output),
                stderr: captured.stderr,
            }
        };
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove unusable pack cache entry");
        }
        Ok(filled)
    }
}

impl Drop for PackWriter {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to unlock pack cache entry");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub entries: usize,
    pub used_bytes: u64,
    pub removed: usize,
    pub removed_bytes: u64,
    pub skipped_busy: usize,
}

// ---------------------------------------------------------------------------
// Blocking helpers
// ---------------------------------------------------------------------------

fn open_complete(path: PathBuf) -> Result<Option<PackReader>> {
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to open {}", path.display())),
    };
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to lock {}", path.display())),
    }
    if !still_linked(&file, &path) {
        return Ok(None);
    }
    if !is_complete(&mut file)? {
        warn!(path = %path.display(), "incomplete pack cache entry");
        return Ok(None);
    }
    // Recency for the cleaner.
    if let Err(e) = file.set_modified(SystemTime::now()) {
        debug!(path = %path.display(), error = %e, "failed to touch pack cache entry");
    }
    let size = file.metadata()?.len();
    Ok(Some(PackReader { file, size }))
}

fn try_lock_entry(path: &Path) -> Result<Option<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    match file.try_lock_exclusive() {
        // Removed by the cleaner between open and lock: retry on a new file.
        Ok(()) if !still_linked(&file, path) => Ok(None),
        Ok(()) => Ok(Some(file)),
        Err(e) if is_contended(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock {}", path.display())),
    }
}

fn is_complete(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len < FLUSH.len() as u64 {
        return Ok(false);
    }
    let mut tail = [0u8; 4];
    file.seek(SeekFrom::End(-(FLUSH.len() as i64)))?;
    file.read_exact(&mut tail)?;
    Ok(tail == FLUSH)
}

struct Entry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

fn scan_entries(root: &Path) -> Vec<Entry> {
    let Ok(shards) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    for shard in shards.flatten() {
        if !shard.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let Ok(files) = std::fs::read_dir(shard.path()) else {
            continue;
        };
        for file in files.flatten() {
            let Ok(meta) = file.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            entries.push(Entry {
                path: file.path(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
    entries
}

/// Remove `path` unless somebody holds its lock.
fn remove_unless_busy(path: &Path) -> std::io::Result<bool> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Ok(false),
        Err(e) => return Err(e),
    }
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

fn clean_blocking(root: &Path, max_bytes: u64, metrics: &Metrics) -> Result<CleanReport> {
    std::fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(root.join(CLEAN_LOCK))
        .context("failed to open pack cache clean lock")?;
    match lock.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if is_contended(&e) => {
            debug!("pack cache is being cleaned by another process");
            return Ok(CleanReport::default());
        }
        Err(e) => return Err(e).context("failed to take pack cache clean lock"),
    }

    let mut entries = scan_entries(root);
    let total: u64 = entries.iter().map(|e| e.size).sum();
    metrics.pack_cache_used_bytes.set(total as i64);
    let mut report = CleanReport {
        entries: entries.len(),
        used_bytes: total,
        ..Default::default()
    };
    if total <= max_bytes {
        debug!(total, max_bytes, "pack cache within budget");
        FileExt::unlock(&lock).ok();
        return Ok(report);
    }

    entries.sort_by_key(|e| e.modified);
    for entry in entries {
        if report.used_bytes <= max_bytes {
            break;
        }
        match remove_unless_busy(&entry.path) {
            Ok(true) => {
                report.used_bytes = report.used_bytes.saturating_sub(entry.size);
                report.removed += 1;
                report.removed_bytes += entry.size;
                metrics.pack_cache_evicted_bytes.observe(entry.size as f64);
                metrics.pack_cache_used_bytes.set(report.used_bytes as i64);
            }
            Ok(false) => report.skipped_busy += 1,
            Err(e) => warn!(path = %entry.path.display(), error = %e, "failed to remove cached pack"),
        }
    }

    info!(
        removed = report.removed,
        removed_bytes = report.removed_bytes,
        skipped_busy = report.skipped_busy,
        used_bytes = report.used_bytes,
        max_bytes,
        "pack cache cleaned"
    );
    FileExt::unlock(&lock).ok();
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::process::Stdio;

    use futures::StreamExt;
    use reqwest::Url;

    use super::*;
    use crate::http::pktline::encode_pkt_line;
    use crate::metrics::MetricsRegistry;

    const OID: &str = "1111111111111111111111111111111111111111";

    fn identity() -> RepositoryIdentity {
        let base = Url::parse("https://git.example.com/").unwrap();
        RepositoryIdentity::from_request_path(&base, "group/repo").unwrap()
    }

    fn request(agent: &str) -> UploadRequest {
        let mut body = encode_pkt_line(format!("want {OID} side-band-64k agent={agent}\n").as_bytes());
        body.extend_from_slice(FLUSH);
        body.extend(encode_pkt_line(b"done\n"));
        UploadRequest::parse(&body)
    }

    fn cache(tmp: &Path, max_bytes: u64) -> (PackCache, Arc<Metrics>) {
        let metrics = MetricsRegistry::new().metrics;
        let config = PackCacheConfig {
            enabled: true,
            max_bytes,
            clean_interval: 60,
        };
        (PackCache::new(tmp, &config, Arc::clone(&metrics)), metrics)
    }

    fn relay_config() -> RelayConfig {
        RelayConfig {
            chunk_size: 4096,
            channel_capacity: 2,
            deadline: None,
            process_wait_timeout: Duration::from_secs(2),
        }
    }

    fn sh(script: &str) -> Child {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    async fn read_all(reader: &PackReader) -> Vec<u8> {
        let mut stream = reader.stream(1024).unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    async fn store(cache: &PackCache, key: &PackKey, payload: &str) {
        let writer = cache.lock_for_write(key, soon()).await.unwrap();
        let filled = writer
            .fill(sh(&format!("printf '{payload}'")), Bytes::new(), relay_config())
            .await
            .unwrap();
        assert!(matches!(filled, Filled::Complete { .. }), "{filled:?}");
    }

    #[test]
    fn key_ignores_agent_but_not_protocol_or_repo() {
        let a = PackKey::new(&identity(), 0, &request("git/2.39.0"));
        assert_eq!(a, PackKey::new(&identity(), 0, &request("git/2.43.0")));
        assert_ne!(a, PackKey::new(&identity(), 2, &request("git/2.39.0")));

        let other = RepositoryIdentity::from_key("git.example.com/group/other").unwrap();
        assert_ne!(a, PackKey::new(&other, 0, &request("git/2.39.0")));
        assert_eq!(a.to_string().len(), 64);
    }

    #[tokio::test]
    async fn generated_pack_is_replayed() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache(tmp.path(), u64::MAX);
        let key = PackKey::new(&identity(), 0, &request("git/2.43.0"));

        assert!(cache.open(&key).await.unwrap().is_none());
        store(&cache, &key, "0008NAK\\n0000").await;

        let reader = cache.open(&key).await.unwrap().unwrap();
        assert_eq!(reader.size(), 12);
        assert_eq!(read_all(&reader).await, b"0008NAK\n0000");
    }

    #[tokio::test]
    async fn failed_generation_is_not_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache(tmp.path(), u64::MAX);
        let key = PackKey::new(&identity(), 0, &request("git/2.43.0"));

        let writer = cache.lock_for_write(&key, soon()).await.unwrap();
        let filled = writer
            .fill(sh("printf partial; echo 'not our ref' >&2; exit 128"), Bytes::new(), relay_config())
            .await
            .unwrap();

        match filled {
            Filled::Failed { output, stderr } => {
                assert_eq!(&output[..], b"partial");
                assert_eq!(stderr.trim(), "not our ref");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(cache.open(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn output_without_trailing_flush_is_unusable() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache(tmp.path(), u64::MAX);
        let key = PackKey::new(&identity(), 0, &request("git/2.43.0"));

        let writer = cache.lock_for_write(&key, soon()).await.unwrap();
        let filled = writer.fill(sh("printf PACK"), Bytes::new(), relay_config()).await.unwrap();
        assert!(matches!(filled, Filled::Unusable));
        assert!(cache.open(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entry_being_written_is_not_served_and_blocks_a_second_writer() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache(tmp.path(), u64::MAX);
        let key = PackKey::new(&identity(), 0, &request("git/2.43.0"));
        store(&cache, &key, "0000").await;

        let mut writer = cache.lock_for_write(&key, soon()).await.unwrap();
        assert!(writer.complete());
        assert!(cache.open(&key).await.unwrap().is_none());
        let waited = cache
            .lock_for_write(&key, Instant::now() + Duration::from_millis(150))
            .await;
        assert!(waited.is_err());

        drop(writer);
        assert!(cache.open(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleaner_removes_oldest_and_spares_entries_being_read() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, metrics) = cache(tmp.path(), 10);
        let keys: Vec<PackKey> = ["a", "b", "c"]
            .iter()
            .map(|agent| {
                let mut req = request("git");
                req.args.push(agent.to_string());
                PackKey::new(&identity(), 0, &req)
            })
            .collect();
        for key in &keys {
            store(&cache, key, "00000000").await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // The oldest entry is in use.
        let reading = cache.open(&keys[0]).await.unwrap().unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        reading.file.set_modified(old).unwrap();

        let report = cache.clean().await.unwrap();

        assert_eq!(report.entries, 3);
        assert_eq!(report.used_bytes, 8);
        assert_eq!(report.removed, 2);
        assert_eq!(report.skipped_busy, 1);
        assert_eq!(metrics.pack_cache_used_bytes.get(), 8);
        assert!(cache.open(&keys[2]).await.unwrap().is_none());
        assert_eq!(read_all(&reading).await, b"00000000");
    }
}
