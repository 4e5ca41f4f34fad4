mod auth;
mod cache;
mod config;
mod coordination;
mod credentials;
mod git;
mod health;
mod http;
mod metrics;
mod sync;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::UpstreamAuthorizer;
use crate::cache::{CacheManager, MirrorStore, PackCache};
use crate::config::Config;
use crate::coordination::{LockTimeouts, RequestCoalescer};
use crate::git::Git;
use crate::metrics::MetricsRegistry;
use crate::sync::{RetryPolicy, UpstreamSync};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "git-cdn", about = "Caching reverse proxy for git smart HTTP")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/git-cdn/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub upstream_base: Url,
    pub metrics: MetricsRegistry,
    pub http_client: reqwest::Client,
    pub store: Arc<MirrorStore>,
    /// `None` when the pack cache is disabled.
    pub pack_cache: Option<Arc<PackCache>>,
    pub coalescer: RequestCoalescer,
    pub authorizer: Arc<UpstreamAuthorizer>,
    pub git: Arc<Git>,
    /// Semaphore limiting concurrent `git upload-pack` processes.
    pub upload_pack_slots: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let upstream_base = Url::parse(&config.upstream.base_url)
            .with_context(|| format!("invalid upstream base_url {:?}", config.upstream.base_url))?;

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("git-cdn/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build reqwest client")?;

        let metrics = MetricsRegistry::new();
        let store = Arc::new(MirrorStore::new(&config.cache.root));
        let git = Arc::new(Git::new(&config.git));
        let pack_cache = config.pack_cache.enabled.then(|| {
            Arc::new(PackCache::new(
                &config.cache.root,
                &config.pack_cache,
                Arc::clone(&metrics.metrics),
            ))
        });

        let syncer = Arc::new(UpstreamSync::new(
            git.clone(),
            Arc::clone(&store),
            upstream_base.clone(),
            RetryPolicy::from(&config.sync),
            Arc::clone(&metrics.metrics),
        ));
        let coalescer = RequestCoalescer::new(
            Arc::clone(&store),
            syncer,
            LockTimeouts::from(&config.lock),
            Arc::clone(&metrics.metrics),
        );
        let authorizer = Arc::new(UpstreamAuthorizer::new(
            http_client.clone(),
            upstream_base.clone(),
            config.auth.enabled,
            Duration::from_secs(config.auth.cache_ttl),
            RetryPolicy {
                attempt_timeout: Duration::from_secs(config.auth.request_timeout.max(1)),
                ..RetryPolicy::from(&config.sync)
            },
            Arc::clone(&metrics.metrics),
        ));

        Ok(Self {
            upload_pack_slots: Arc::new(Semaphore::new(
                config.serve.max_concurrent_upload_packs.max(1),
            )),
            config,
            upstream_base,
            metrics,
            http_client,
            store,
            pack_cache,
            coalescer,
            authorizer,
            git,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.serve.request_timeout)
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = %cli.config,
        node_id = coordination::node::node_id(),
        "starting git-cdn"
    );

    // ---- App state ----
    let state = AppState::new(Arc::clone(&config))?;

    // ---- Cache root must be usable before accepting traffic ----
    state.store.ensure_writable().await.with_context(|| {
        format!("cache root {} is not writable", config.cache.root.display())
    })?;
    tracing::info!(
        upstream = %credentials::redact_url(state.upstream_base.as_str()),
        cache_root = %config.cache.root.display(),
        "mirror cache ready"
    );

    // ---- Background cleaning ----
    let cache_manager = Arc::new(CacheManager::new(
        Arc::clone(&state.store),
        &config.cache,
        config.pinned_repos(),
        LockTimeouts::from(&config.lock),
        Arc::clone(&state.metrics.metrics),
    ));
    let eviction_handle = tokio::spawn(
        cache_manager.run_eviction_loop(Duration::from_secs(config.cache.eviction_interval.max(1))),
    );

    let clean_handle = state.pack_cache.clone().map(|pack_cache| {
        tokio::spawn(
            pack_cache.run_clean_loop(Duration::from_secs(config.pack_cache.clean_interval.max(1))),
        )
    });

    // ---- Serve until shutdown ----
    let coalescer = state.coalescer.clone();
    let served = run_http_server(state).await;
    let interrupted = coalescer.in_flight();
    if interrupted > 0 {
        tracing::warn!(interrupted, "shutting down with mirror refreshes in flight");
    }
    eviction_handle.abort();
    if let Some(handle) = clean_handle {
        handle.abort();
    }
    if let Err(e) = served {
        tracing::error!(error = %e, "HTTP server failed");
        return Err(e);
    }

    tracing::info!("git-cdn shut down cleanly");
    Ok(())
}
