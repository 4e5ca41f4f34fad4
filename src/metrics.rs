use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SyncKind {
    Clone,
    Fetch,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SyncOutcome {
    Ok,
    Transient,
    Timeout,
    Permanent,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    pub kind: SyncKind,
    pub outcome: SyncOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncKindLabels {
    pub kind: SyncKind,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheResult {
    Hit,
    Miss,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub result: CacheResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Operation {
    InfoRefs,
    UploadPack,
    ReceivePack,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: Operation,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResponseLabels {
    pub operation: Operation,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Source {
    Mirror,
    PackCache,
    Upstream,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SourceLabels {
    pub source: Source,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- upstream sync --
    pub sync_attempts: Family<SyncLabels, Counter>,
    pub sync_duration_seconds: Family<SyncKindLabels, Histogram>,
    pub upstream_received_bytes: Histogram,

    // -- cache --
    pub cache_requests: Family<CacheLabels, Counter>,
    pub coalesced_requests: Counter,
    pub mirrors_evicted: Counter,
    pub cache_size_bytes: Gauge,
    pub cache_mirrors: Gauge,

    // -- pack cache --
    pub pack_cache_requests: Family<CacheLabels, Counter>,
    pub pack_cache_evicted_bytes: Histogram,
    pub pack_cache_used_bytes: Gauge,

    // -- locks --
    pub lock_acquisitions: Counter,
    pub lock_timeouts: Counter,
    pub lock_reclaims: Counter,

    // -- auth --
    pub auth_cache_hits: Counter,
    pub auth_cache_misses: Counter,

    // -- serving --
    pub sent_bytes: Family<SourceLabels, Counter>,
    pub client_disconnects: Counter,
    pub responses: Family<ResponseLabels, Counter>,
    pub active_sessions: Family<OperationLabels, Gauge>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let sync_attempts = Family::<SyncLabels, Counter>::default();
        registry.register(
            "git_cdn_sync_attempts",
            "Upstream clone/fetch attempts by kind and outcome",
            sync_attempts.clone(),
        );

        let sync_duration_seconds =
            Family::<SyncKindLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.05, 2.0, 16))
            });
        registry.register(
            "git_cdn_sync_duration_seconds",
            "Duration of a complete sync including retries",
            sync_duration_seconds.clone(),
        );

        let upstream_received_bytes = Histogram::new(exponential_buckets(1024.0, 4.0, 14));
        registry.register(
            "git_cdn_upstream_received_bytes",
            "Pack bytes received from upstream per successful sync",
            upstream_received_bytes.clone(),
        );

        let cache_requests = Family::<CacheLabels, Counter>::default();
        registry.register(
            "git_cdn_cache_requests",
            "Freshness checks by result",
            cache_requests.clone(),
        );

        let coalesced_requests = Counter::default();
        registry.register(
            "git_cdn_coalesced_requests",
            "Requests that joined a refresh already in flight",
            coalesced_requests.clone(),
        );

        let mirrors_evicted = Counter::default();
        registry.register(
            "git_cdn_mirrors_evicted",
            "Mirrors removed by the eviction sweep",
            mirrors_evicted.clone(),
        );

        let cache_size_bytes: Gauge = Gauge::default();
        registry.register(
            "git_cdn_cache_size_bytes",
            "Disk usage of all mirrors in bytes",
            cache_size_bytes.clone(),
        );

        let cache_mirrors: Gauge = Gauge::default();
        registry.register(
            "git_cdn_cache_mirrors",
            "Number of mirrors on disk",
            cache_mirrors.clone(),
        );

        let pack_cache_requests = Family::<CacheLabels, Counter>::default();
        registry.register(
            "git_cdn_pack_cache_requests",
            "Cacheable upload-pack requests by pack cache result",
            pack_cache_requests.clone(),
        );

        let pack_cache_evicted_bytes = Histogram::new(exponential_buckets(1024.0, 4.0, 14));
        registry.register(
            "git_cdn_pack_cache_evicted_bytes",
            "Size of each pack removed by the pack cache cleaner",
            pack_cache_evicted_bytes.clone(),
        );

        let pack_cache_used_bytes: Gauge = Gauge::default();
        registry.register(
            "git_cdn_pack_cache_used_bytes",
            "Disk usage of cached packs in bytes",
            pack_cache_used_bytes.clone(),
        );

        let lock_acquisitions = Counter::default();
        registry.register(
            "git_cdn_lock_acquisitions",
            "Repository lock acquisitions",
            lock_acquisitions.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "git_cdn_lock_timeouts",
            "Repository lock acquisitions that timed out",
            lock_timeouts.clone(),
        );

        let lock_reclaims = Counter::default();
        registry.register(
            "git_cdn_lock_reclaims",
            "Abandoned repository locks taken over",
            lock_reclaims.clone(),
        );

        let auth_cache_hits = Counter::default();
        registry.register(
            "git_cdn_auth_cache_hits",
            "Auth cache hits",
            auth_cache_hits.clone(),
        );

        let auth_cache_misses = Counter::default();
        registry.register(
            "git_cdn_auth_cache_misses",
            "Auth cache misses",
            auth_cache_misses.clone(),
        );

        let sent_bytes = Family::<SourceLabels, Counter>::default();
        registry.register(
            "git_cdn_sent_bytes",
            "Bytes streamed to clients by source",
            sent_bytes.clone(),
        );

        let client_disconnects = Counter::default();
        registry.register(
            "git_cdn_client_disconnects",
            "Responses aborted because the client went away",
            client_disconnects.clone(),
        );

        let responses = Family::<ResponseLabels, Counter>::default();
        registry.register(
            "git_cdn_responses",
            "Responses by git operation and HTTP status",
            responses.clone(),
        );

        let active_sessions = Family::<OperationLabels, Gauge>::default();
        registry.register(
            "git_cdn_active_sessions",
            "Requests currently being handled by git operation",
            active_sessions.clone(),
        );

        Self {
            sync_attempts,
            sync_duration_seconds,
            upstream_received_bytes,
            cache_requests,
            coalesced_requests,
            mirrors_evicted,
            cache_size_bytes,
            cache_mirrors,
            pack_cache_requests,
            pack_cache_evicted_bytes,
            pack_cache_used_bytes,
            lock_acquisitions,
            lock_timeouts,
            lock_reclaims,
            auth_cache_hits,
            auth_cache_misses,
            sent_bytes,
            client_disconnects,
            responses,
            active_sessions,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        let registry = MetricsRegistry::new();
        registry
            .metrics
            .sync_attempts
            .get_or_create(&SyncLabels {
                kind: SyncKind::Fetch,
                outcome: SyncOutcome::Transient,
            })
            .inc();
        registry.metrics.coalesced_requests.inc_by(3);

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &registry.registry).unwrap();
        assert!(out.contains("git_cdn_sync_attempts_total{kind=\"Fetch\",outcome=\"Transient\"} 1"));
        assert!(out.contains("git_cdn_coalesced_requests_total 3"));
    }
}
