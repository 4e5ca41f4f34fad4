use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub pack_cache: PackCacheConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub serve: ServeConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub repo_overrides: HashMap<String, RepoOverride>,
}

impl Config {
    /// Per-repo override for `repo_path`, matched with and without a
    /// trailing `.git`.
    pub fn override_for(&self, repo_path: &str) -> Option<&RepoOverride> {
        let trimmed = repo_path.trim_matches('/');
        let bare = trimmed.strip_suffix(".git").unwrap_or(trimmed);
        self.repo_overrides
            .iter()
            .find(|(k, _)| {
                let k = k.trim_matches('/');
                k == bare || k.strip_suffix(".git") == Some(bare)
            })
            .map(|(_, o)| o)
    }

    /// Freshness window for a repository, honouring per-repo overrides.
    pub fn freshness_window_for(&self, repo_path: &str) -> Duration {
        let secs = self
            .override_for(repo_path)
            .and_then(|o| o.freshness_window)
            .unwrap_or(self.cache.freshness_window);
        Duration::from_secs(secs)
    }

    /// Repositories that eviction must never remove.
    pub fn pinned_repos(&self) -> Vec<String> {
        self.repo_overrides
            .iter()
            .filter(|(_, o)| o.pinned)
            .map(|(k, _)| {
                let k = k.trim_matches('/');
                k.strip_suffix(".git").unwrap_or(k).to_string()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL every request path is resolved against
    /// (e.g. `https://gitlab.example.com/`).
    pub base_url: String,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8000`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8000".to_string()
}

// ---------------------------------------------------------------------------
// Mirror cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Root directory shared by every worker process.
    pub root: PathBuf,
    /// Maximum age (seconds) of the last successful sync for a mirror to be
    /// served without refreshing it first.
    #[serde(default = "default_freshness_window")]
    pub freshness_window: u64,
    /// Ceiling for the mirror cache in bytes.  `0` disables eviction.
    #[serde(default)]
    pub max_bytes: u64,
    /// Eviction starts when usage exceeds this fraction (0.0 .. 1.0).
    #[serde(default = "default_high_water")]
    pub high_water_mark: f64,
    /// Eviction stops when usage drops below this fraction.
    #[serde(default = "default_low_water")]
    pub low_water_mark: f64,
    /// Seconds between two eviction sweeps.
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval: u64,
}

fn default_freshness_window() -> u64 {
    60
}

fn default_high_water() -> f64 {
    0.90
}

fn default_low_water() -> f64 {
    0.75
}

fn default_eviction_interval() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Pack cache
// ---------------------------------------------------------------------------

/// Generated upload-pack responses kept on disk under `{cache.root}/packs`.
#[derive(Debug, Clone, Deserialize)]
pub struct PackCacheConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Ceiling for cached packs in bytes.
    #[serde(default = "default_pack_cache_max_bytes")]
    pub max_bytes: u64,
    /// Seconds between two cleaning passes.
    #[serde(default = "default_pack_cache_clean_interval")]
    pub clean_interval: u64,
}

impl Default for PackCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: default_pack_cache_max_bytes(),
            clean_interval: default_pack_cache_clean_interval(),
        }
    }
}

fn default_pack_cache_max_bytes() -> u64 {
    20 * 1024 * 1024 * 1024
}

fn default_pack_cache_clean_interval() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Repository lock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// How long (seconds) a waiter blocks for the repository lock.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,
    /// Seconds without a heartbeat from the holder after which a held lock
    /// is considered abandoned.  Must exceed the longest possible sync.
    #[serde(default = "default_stale_after")]
    pub stale_after: u64,
    /// Polling interval while waiting for the lock.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: default_acquire_timeout(),
            stale_after: default_stale_after(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_acquire_timeout() -> u64 {
    90
}

fn default_stale_after() -> u64 {
    7200
}

fn default_poll_interval_ms() -> u64 {
    250
}

// ---------------------------------------------------------------------------
// Upstream sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Attempts per sync, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay; doubled after every failed attempt.
    #[serde(default = "default_backoff_start_ms")]
    pub backoff_start_ms: u64,
    /// Upper bound (seconds) on a single clone or fetch.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_start_ms: default_backoff_start_ms(),
            attempt_timeout: default_attempt_timeout(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_start_ms() -> u64 {
    500
}

fn default_attempt_timeout() -> u64 {
    900
}

// ---------------------------------------------------------------------------
// git binary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_git_binary")]
    pub binary: String,
    /// `-c key=value` overrides passed to every git invocation.
    #[serde(default = "default_git_overrides")]
    pub config: BTreeMap<String, String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            config: default_git_overrides(),
        }
    }
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_git_overrides() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("http.postBuffer".to_string(), "524288000".to_string()),
        ("pack.threads".to_string(), "4".to_string()),
        ("uploadpack.allowFilter".to_string(), "true".to_string()),
    ])
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

/// What to do with `git-receive-pack` traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceivePackPolicy {
    /// Proxy pushes to upstream, then invalidate the mirror.
    #[default]
    Bypass,
    /// Refuse pushes with 403.
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServeConfig {
    /// Largest chunk forwarded to a client in one write.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Chunks buffered between a producer and the client before the producer
    /// is paused.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Overall deadline (seconds) for a single request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Grace period (seconds) a finished git process gets to exit before it
    /// is killed.
    #[serde(default = "default_process_wait_timeout")]
    pub process_wait_timeout: u64,
    #[serde(default = "default_max_concurrent_upload_packs")]
    pub max_concurrent_upload_packs: usize,
    /// Largest accepted upload-pack request body (after gunzip).
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    #[serde(default)]
    pub receive_pack: ReceivePackPolicy,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            channel_capacity: default_channel_capacity(),
            request_timeout: default_request_timeout(),
            process_wait_timeout: default_process_wait_timeout(),
            max_concurrent_upload_packs: default_max_concurrent_upload_packs(),
            max_request_bytes: default_max_request_bytes(),
            receive_pack: ReceivePackPolicy::default(),
        }
    }
}

fn default_chunk_size() -> usize {
    32 * 1024
}

fn default_channel_capacity() -> usize {
    8
}

fn default_request_timeout() -> u64 {
    3600
}

fn default_process_wait_timeout() -> u64 {
    2
}

fn default_max_concurrent_upload_packs() -> usize {
    32
}

fn default_max_request_bytes() -> usize {
    100 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Client credential check
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Validate client credentials against upstream before serving from the
    /// mirror.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Positive auth cache TTL in seconds.  `0` disables the cache.
    #[serde(default = "default_auth_cache_ttl")]
    pub cache_ttl: u64,
    /// Per-attempt timeout of the upstream check in seconds.  Attempts and
    /// backoff follow `sync`.
    #[serde(default = "default_auth_request_timeout")]
    pub request_timeout: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl: default_auth_cache_ttl(),
            request_timeout: default_auth_request_timeout(),
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_auth_cache_ttl() -> u64 {
    300
}

fn default_auth_request_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Per-repo overrides
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RepoOverride {
    /// Override freshness window (seconds) for this repo.
    pub freshness_window: Option<u64>,
    /// Never evict this repo's mirror.
    #[serde(default)]
    pub pinned: bool,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    let base = reqwest::Url::parse(&config.upstream.base_url)
        .with_context(|| format!("invalid upstream.base_url: {}", config.upstream.base_url))?;
    anyhow::ensure!(
        matches!(base.scheme(), "http" | "https" | "file"),
        "upstream.base_url must be an http, https or file URL"
    );
    anyhow::ensure!(
        config.cache.high_water_mark > config.cache.low_water_mark,
        "high_water_mark must be greater than low_water_mark"
    );
    anyhow::ensure!(
        config.cache.high_water_mark <= 1.0 && config.cache.low_water_mark >= 0.0,
        "water marks must be in range [0.0, 1.0]"
    );
    anyhow::ensure!(config.sync.max_attempts >= 1, "sync.max_attempts must be at least 1");
    anyhow::ensure!(config.serve.chunk_size > 0, "serve.chunk_size must be positive");
    anyhow::ensure!(
        config.serve.channel_capacity > 0,
        "serve.channel_capacity must be positive"
    );
    anyhow::ensure!(
        config.serve.max_concurrent_upload_packs > 0,
        "serve.max_concurrent_upload_packs must be positive"
    );
    anyhow::ensure!(
        config.lock.poll_interval_ms > 0,
        "lock.poll_interval_ms must be positive"
    );
    let longest_sync = crate::sync::RetryPolicy::from(&config.sync).worst_case();
    anyhow::ensure!(
        Duration::from_secs(config.lock.stale_after) > longest_sync,
        "lock.stale_after ({}s) must exceed the longest possible sync ({}s: \
         sync.max_attempts x sync.attempt_timeout plus backoff)",
        config.lock.stale_after,
        longest_sync.as_secs_f64().ceil()
    );
    Ok(())
}
