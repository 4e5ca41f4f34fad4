//! Main axum router and HTTP request handlers for the git caching proxy.
//!
//! Routes:
//! - `GET  /{repo}/info/refs?service=…` - ref advertisement
//! - `POST /{repo}/git-upload-pack`      - pack negotiation / data transfer
//! - `POST /{repo}/git-receive-pack`     - proxied to upstream or rejected
//! - `GET  /healthz`                     - Health check
//! - `GET  /metrics`                     - Prometheus metrics

use std::io::Read;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::AuthError;
use crate::cache::{
    Filled, IdentityError, MirrorReadGuard, MirrorRecord, PackCache, PackKey, PackReader,
    RepositoryIdentity,
};
use crate::config::ReceivePackPolicy;
use crate::coordination::Freshness;
use crate::http::pktline::{self, UploadRequest};
use crate::http::relay::{self, ChildInput, RelayConfig, RelayOutcome};
use crate::http::session::{
    parse_request, ClientSession, GitRequest, RequestError, Service, SessionState,
};
use crate::metrics::{
    CacheLabels, CacheResult, Metrics, OperationLabels, ResponseLabels, Source, SourceLabels,
};
use crate::sync::{PermanentKind, SyncError};
use crate::AppState;

const GIT_PROTOCOL: &str = "git-protocol";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/{*path}", get(handle_git).post(handle_git))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Git smart HTTP
// ---------------------------------------------------------------------------

/// Entry point for every smart-HTTP request.
#[instrument(skip_all, fields(method = %method, path = %uri.path()))]
async fn handle_git(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let mut session = ClientSession::new(
        state.request_timeout(),
        header_string(&headers, GIT_PROTOCOL),
        header_string(&headers, header::AUTHORIZATION.as_str()),
    );
    session.advance(SessionState::Resolving);

    let (repo_path, request) = match parse_request(method == Method::POST, uri.path(), uri.query()) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "rejecting request");
            return AppError::from(e).into_response();
        }
    };
    let operation = request.operation();
    session.request = Some(request);

    let active = state
        .metrics
        .metrics
        .active_sessions
        .get_or_create(&OperationLabels {
            operation: operation.clone(),
        })
        .clone();
    active.inc();

    let deadline = session.deadline;
    let result = tokio::time::timeout_at(
        deadline,
        route_git(&state, &mut session, &repo_path, request, &headers, body),
    )
    .await
    .unwrap_or_else(|_| {
        Err(AppError::GatewayTimeout(
            "request timed out before serving started".into(),
        ))
    });

    let response = match result {
        Ok((response, relay)) => {
            tokio::spawn(finish_session(
                state.metrics.metrics.clone(),
                session,
                relay,
                active,
            ));
            response
        }
        Err(err) => {
            session.fail(err.to_string());
            active.dec();
            err.into_response()
        }
    };

    state
        .metrics
        .metrics
        .responses
        .get_or_create(&ResponseLabels {
            operation,
            status: response.status().as_u16().to_string(),
        })
        .inc();
    response
}

/// A response whose body is still being produced.
struct Streaming {
    handle: JoinHandle<RelayOutcome>,
    source: Source,
    /// Released once the body is complete.
    held: Held,
    /// Runs after a successful relay.
    after: Option<AfterRelay>,
}

/// What a response keeps alive while its body streams.
#[derive(Default)]
struct Held {
    _permit: Option<OwnedSemaphorePermit>,
    _mirror: Option<MirrorReadGuard>,
    _pack: Option<PackReader>,
}

enum AfterRelay {
    Invalidate(Arc<AppState>, RepositoryIdentity),
}

async fn route_git(
    state: &Arc<AppState>,
    session: &mut ClientSession,
    repo_path: &str,
    request: GitRequest,
    headers: &HeaderMap,
    body: Body,
) -> Result<(Response, Streaming), AppError> {
    let identity = RepositoryIdentity::from_request_path(&state.upstream_base, repo_path)?;
    session.identity = Some(identity.clone());

    match request.service() {
        Service::UploadPack => serve_upload_pack(state, session, &identity, request, headers, body).await,
        Service::ReceivePack => match state.config.serve.receive_pack {
            ReceivePackPolicy::Reject => Err(AppError::Forbidden(
                "pushes are not accepted by this proxy".into(),
            )),
            ReceivePackPolicy::Bypass => {
                proxy_receive_pack(state, session, &identity, request, headers, body).await
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Upload-pack from the mirror
// ---------------------------------------------------------------------------

async fn serve_upload_pack(
    state: &Arc<AppState>,
    session: &mut ClientSession,
    identity: &RepositoryIdentity,
    request: GitRequest,
    headers: &HeaderMap,
    body: Body,
) -> Result<(Response, Streaming), AppError> {
    state
        .authorizer
        .authorize(identity, session.authorization.as_deref())
        .await?;

    let discovery = matches!(request, GitRequest::Discovery(_));
    let input = if discovery {
        Bytes::new()
    } else {
        read_request_body(body, headers, state.config.serve.max_request_bytes).await?
    };
    let upload = UploadRequest::parse(&input);
    let config = RelayConfig::from_serve(&state.config.serve, Some(session.deadline));

    if let Some(pack_cache) = state.pack_cache.as_ref() {
        if !discovery && upload.cacheable() {
            let key = PackKey::new(identity, session.protocol_version(), &upload);
            return serve_from_pack_cache(state, session, identity, pack_cache, key, &upload, input, config)
                .await;
        }
    }
    serve_live(state, session, identity, request, &upload.wants, input, config).await
}

/// Run upload-pack against the mirror and stream its output.
async fn serve_live(
    state: &Arc<AppState>,
    session: &mut ClientSession,
    identity: &RepositoryIdentity,
    request: GitRequest,
    wants: &[String],
    input: Bytes,
    config: RelayConfig,
) -> Result<(Response, Streaming), AppError> {
    let discovery = matches!(request, GitRequest::Discovery(_));
    session.advance(SessionState::Refreshing);
    let (record, mirror) = ready_mirror(state, session, identity, wants).await?;
    let permit = upload_slot(state).await?;

    session.advance(SessionState::Serving);
    let child = state
        .git
        .spawn_upload_pack(&record.repo_path(), discovery, session.protocol.as_deref())?;
    let (mut body, handle) = relay::relay_child(child, Service::UploadPack.name(), input, config);

    if discovery && session.protocol_version() < 2 {
        body = with_preamble(pktline::service_advertisement(Service::UploadPack.name()), body);
    }

    Ok((
        git_response(request, body),
        Streaming {
            handle,
            source: Source::Mirror,
            held: Held {
                _permit: Some(permit),
                _mirror: Some(mirror),
                _pack: None,
            },
            after: None,
        },
    ))
}

/// Replay a cached upload-pack response, generating it first on a miss.
#[allow(clippy::too_many_arguments)]
async fn serve_from_pack_cache(
    state: &Arc<AppState>,
    session: &mut ClientSession,
    identity: &RepositoryIdentity,
    pack_cache: &Arc<PackCache>,
    key: PackKey,
    upload: &UploadRequest,
    input: Bytes,
    config: RelayConfig,
) -> Result<(Response, Streaming), AppError> {
    let request = GitRequest::Rpc(Service::UploadPack);
    if let Some(reader) = pack_cache.open(&key).await? {
        count_pack_cache(state, CacheResult::Hit);
        session.advance(SessionState::Serving);
        return replay_pack(request, reader, config);
    }

    let mut writer = pack_cache
        .lock_for_write(&key, session.deadline)
        .await
        .map_err(|e| AppError::GatewayTimeout(format!("{e:#}")))?;
    if writer.complete() {
        // Generated by another request while this one waited.
        drop(writer);
        count_pack_cache(state, CacheResult::Hit);
    } else {
        count_pack_cache(state, CacheResult::Miss);
        session.advance(SessionState::Refreshing);
        let (record, mirror) = ready_mirror(state, session, identity, &upload.wants).await?;
        let permit = upload_slot(state).await?;

        session.advance(SessionState::Serving);
        let child = state
            .git
            .spawn_upload_pack(&record.repo_path(), false, session.protocol.as_deref())?;
        let fill_config = RelayConfig {
            deadline: Some(Instant::now() + state.request_timeout()),
            ..config
        };
        let fill_input = input.clone();
        // Detached so that a client going away does not waste the work.
        let fill = tokio::spawn(async move {
            let filled = writer.fill(child, fill_input, fill_config).await;
            drop((mirror, permit));
            filled
        });
        let filled = fill
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("pack generation task failed: {e}")))??;

        match filled {
            Filled::Complete { bytes } => debug!(%key, bytes, "pack generated"),
            Filled::Failed { output, stderr } => {
                warn!(%key, stderr = %stderr.trim(), "upload-pack failed while generating pack");
                let message = match stderr.trim() {
                    "" => format!("{} failed", Service::UploadPack.name()),
                    text => text.to_string(),
                };
                let mut reply = output.to_vec();
                reply.extend(pktline::error_packet(&message));
                let (body, handle) = relay::relay_stream(
                    futures::stream::iter([Ok::<_, std::io::Error>(Bytes::from(reply))]),
                    config,
                );
                return Ok((
                    git_response(request, body),
                    Streaming {
                        handle,
                        source: Source::Mirror,
                        held: Held::default(),
                        after: None,
                    },
                ));
            }
            Filled::Unusable => {
                return serve_live(state, session, identity, request, &upload.wants, input, config).await;
            }
        }
    }

    match pack_cache.open(&key).await? {
        Some(reader) => replay_pack(request, reader, config),
        None => {
            warn!(%key, "cached pack vanished before it could be served; serving live");
            serve_live(state, session, identity, request, &upload.wants, input, config).await
        }
    }
}

fn replay_pack(
    request: GitRequest,
    reader: PackReader,
    config: RelayConfig,
) -> Result<(Response, Streaming), AppError> {
    debug!(bytes = reader.size(), "serving pack from cache");
    let (body, handle) = relay::relay_stream(reader.stream(config.chunk_size)?, config);
    Ok((
        git_response(request, body),
        Streaming {
            handle,
            source: Source::PackCache,
            held: Held {
                _pack: Some(reader),
                ..Held::default()
            },
            after: None,
        },
    ))
}

fn count_pack_cache(state: &AppState, result: CacheResult) {
    state
        .metrics
        .metrics
        .pack_cache_requests
        .get_or_create(&CacheLabels { result })
        .inc();
}

async fn upload_slot(state: &AppState) -> Result<OwnedSemaphorePermit, AppError> {
    state
        .upload_pack_slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("upload-pack semaphore closed: {e}")))
}

/// Refresh the mirror as needed and hold it against eviction.  A mirror
/// evicted between the two is refreshed once more.
async fn ready_mirror(
    state: &AppState,
    session: &ClientSession,
    identity: &RepositoryIdentity,
    wants: &[String],
) -> Result<(MirrorRecord, MirrorReadGuard), AppError> {
    for _ in 0..2 {
        let record = refresh_mirror(state, session, identity, wants).await?;
        if let Some(guard) = state.store.read_lock(&record).await? {
            if let Err(e) = state.store.touch(&record).await {
                warn!(error = %e, "failed to record mirror access");
            }
            return Ok((record, guard));
        }
        debug!(repo = %identity, "mirror removed before it could be served; refreshing again");
    }
    Err(AppError::Internal(anyhow::anyhow!(
        "mirror for {identity} was removed while preparing to serve it"
    )))
}

/// Make sure the mirror is fresh enough for this request.  A mirror served
/// from cache that lacks an object the client wants is refreshed once more.
async fn refresh_mirror(
    state: &AppState,
    session: &ClientSession,
    identity: &RepositoryIdentity,
    wants: &[String],
) -> Result<MirrorRecord, AppError> {
    let max_age = state.config.freshness_window_for(identity.path());
    let outcome = state
        .coalescer
        .ensure_fresh(identity, max_age, false, session.credentials())
        .await?;
    debug!(freshness = ?outcome.freshness, coalesced = outcome.coalesced, "mirror ready");

    if wants.is_empty() || !matches!(outcome.freshness, Freshness::Hit) {
        return Ok(outcome.record);
    }

    let missing = match state.git.missing_objects(&outcome.record.repo_path(), wants).await {
        Ok(missing) => missing,
        Err(e) => {
            warn!(error = %e, "could not check wanted objects; serving mirror as is");
            return Ok(outcome.record);
        }
    };
    if missing.is_empty() {
        return Ok(outcome.record);
    }

    info!(missing = missing.len(), "wanted objects not in mirror; forcing refresh");
    let outcome = state
        .coalescer
        .ensure_fresh(identity, max_age, true, session.credentials())
        .await?;
    Ok(outcome.record)
}

// ---------------------------------------------------------------------------
// Receive-pack pass-through
// ---------------------------------------------------------------------------

async fn proxy_receive_pack(
    state: &Arc<AppState>,
    session: &mut ClientSession,
    identity: &RepositoryIdentity,
    request: GitRequest,
    headers: &HeaderMap,
    body: Body,
) -> Result<(Response, Streaming), AppError> {
    session.advance(SessionState::Serving);
    let discovery = matches!(request, GitRequest::Discovery(_));
    let config = RelayConfig::from_serve(&state.config.serve, Some(session.deadline));
    let after = (!discovery).then(|| AfterRelay::Invalidate(state.clone(), identity.clone()));
    if !discovery {
        // And again by `finish_session` once the push has landed.
        state.store.invalidate(identity).await?;
    }
    let upstream_url = identity.upstream_url(&state.upstream_base);

    // A local upstream is pushed to directly.
    if upstream_url.scheme() == "file" {
        let path = upstream_url
            .to_file_path()
            .map_err(|()| AppError::BadRequest(format!("invalid upstream path {upstream_url}")))?;
        let input = if discovery {
            ChildInput::Buffered(Bytes::new())
        } else if is_gzipped(headers) {
            ChildInput::Buffered(
                read_request_body(body, headers, state.config.serve.max_request_bytes).await?,
            )
        } else {
            ChildInput::Streamed(body)
        };
        let child = state.git.spawn_receive_pack(&path, discovery)?;
        let (mut body, handle) = relay::relay_child(child, Service::ReceivePack.name(), input, config);
        if discovery {
            body = with_preamble(pktline::service_advertisement(Service::ReceivePack.name()), body);
        }
        return Ok((
            git_response(request, body),
            Streaming {
                handle,
                source: Source::Upstream,
                held: Held::default(),
                after,
            },
        ));
    }

    let mut url = upstream_url;
    if discovery {
        url.set_path(&format!("{}/info/refs", url.path()));
        url.set_query(Some("service=git-receive-pack"));
    } else {
        url.set_path(&format!("{}/git-receive-pack", url.path()));
    }
    debug!(url = %crate::credentials::redact_url(url.as_str()), "proxying push to upstream");

    let mut upstream = if discovery {
        state.http_client.get(url)
    } else {
        state
            .http_client
            .post(url)
            .body(reqwest::Body::wrap_stream(forward_body(body, config.channel_capacity)))
    };
    for name in [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::CONTENT_ENCODING,
        header::ACCEPT,
        header::USER_AGENT,
    ] {
        if let Some(value) = headers.get(&name) {
            upstream = upstream.header(name.as_str(), value.as_bytes());
        }
    }
    if let Some(protocol) = headers.get(GIT_PROTOCOL) {
        upstream = upstream.header(GIT_PROTOCOL, protocol.as_bytes());
    }

    let resp = upstream
        .send()
        .await
        .map_err(|e| AppError::BadGateway(format!("upstream push request failed: {e}")))?;

    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    if !status.is_success() {
        let challenge = header_from_reqwest(resp.headers(), "www-authenticate");
        let text = resp.text().await.unwrap_or_default();
        warn!(%status, "upstream refused push request");
        let mut response = (status, text).into_response();
        if let Some(challenge) = challenge {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, challenge);
        }
        return Err(AppError::Upstream(response));
    }

    let content_type = header_from_reqwest(resp.headers(), "content-type");
    let (body, handle) = relay::relay_stream(Box::pin(resp.bytes_stream()), config);
    let mut response = git_response(request, body);
    if let Some(content_type) = content_type {
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }

    Ok((
        response,
        Streaming {
            handle,
            source: Source::Upstream,
            held: Held::default(),
            after,
        },
    ))
}

/// Re-feed a client body through a bounded channel so it can be handed to
/// the upstream client.
fn forward_body(body: Body, capacity: usize) -> ReceiverStream<Result<Bytes, std::io::Error>> {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(async move {
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(std::io::Error::other);
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    ReceiverStream::new(rx)
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Wait for a streamed body to finish and account for it.
async fn finish_session(
    metrics: Arc<Metrics>,
    mut session: ClientSession,
    streaming: Streaming,
    active: prometheus_client::metrics::gauge::Gauge,
) {
    let Streaming {
        handle,
        source,
        held,
        after,
    } = streaming;

    let outcome = match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(session = %session.id, error = %e, "relay task failed");
            RelayOutcome::default()
        }
    };
    drop(held);
    active.dec();

    metrics
        .sent_bytes
        .get_or_create(&SourceLabels { source })
        .inc_by(outcome.bytes_sent);
    if outcome.client_disconnected {
        metrics.client_disconnects.inc();
    }

    let repo = session
        .identity
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    if outcome.success {
        session.advance(SessionState::Done);
        if let Some(AfterRelay::Invalidate(state, identity)) = after {
            if let Err(e) = state.store.invalidate(&identity).await {
                error!(repo = %identity, error = %e, "failed to invalidate mirror after push");
            }
        }
    } else if outcome.client_disconnected {
        session.fail("client disconnected");
    } else if outcome.timed_out {
        session.fail("request deadline exceeded");
    } else {
        session.fail(format!("git exited with {:?}", outcome.exit_code));
    }

    info!(
        session = %session.id,
        %repo,
        state = %session.state(),
        bytes_sent = outcome.bytes_sent,
        duration_ms = session.started.elapsed().as_millis() as u64,
        "request finished"
    );
}

// ---------------------------------------------------------------------------
// Health & metrics
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        store: Arc::clone(&state.store),
        upstream_base: state.upstream_base.clone(),
        http_client: state.http_client.clone(),
    };
    crate::health::health_handler(State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn header_from_reqwest(headers: &reqwest::header::HeaderMap, name: &str) -> Option<HeaderValue> {
    headers
        .get(name)
        .and_then(|v| HeaderValue::from_bytes(v.as_bytes()).ok())
}

fn git_response(request: GitRequest, body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request.content_type()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
    );
    response
}

fn with_preamble(preamble: Vec<u8>, body: Body) -> Body {
    let head = futures::stream::once(async move { Ok::<_, axum::Error>(Bytes::from(preamble)) });
    Body::from_stream(head.chain(body.into_data_stream()))
}

/// Buffer an upload-pack request body, gunzipping it if needed.
async fn read_request_body(body: Body, headers: &HeaderMap, limit: usize) -> Result<Bytes, AppError> {
    let raw = axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| AppError::PayloadTooLarge(format!("request body rejected: {e}")))?;

    if !is_gzipped(headers) {
        return Ok(raw);
    }

    tokio::task::spawn_blocking(move || gunzip(&raw, limit))
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("gunzip task failed: {e}")))?
}

fn is_gzipped(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip"))
}

fn gunzip(raw: &[u8], limit: usize) -> Result<Bytes, AppError> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(raw)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| AppError::BadRequest(format!("invalid gzip request body: {e}")))?;
    if out.len() > limit {
        return Err(AppError::PayloadTooLarge(format!(
            "decompressed request body exceeds {limit} bytes"
        )));
    }
    Ok(Bytes::from(out))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{message}")]
    Unauthorized {
        message: String,
        challenge: Option<String>,
    },
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    GatewayTimeout(String),
    /// Upstream's own error response, passed through.
    #[error("upstream answered {}", .0.status())]
    Upstream(Response),
    #[error(transparent)]
    Internal(anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(response) => response.status(),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::Upstream(response) => response,
            Self::Unauthorized { message, challenge } => {
                let challenge = challenge
                    .and_then(|c| HeaderValue::from_str(&c).ok())
                    .unwrap_or_else(|| HeaderValue::from_static("Basic realm=\"git-cdn\""));
                (status, [(header::WWW_AUTHENTICATE, challenge)], message).into_response()
            }
            Self::Internal(err) => {
                error!(error = %err, "internal server error");
                (status, format!("Internal server error: {err:#}")).into_response()
            }
            Self::GatewayTimeout(msg) | Self::BadGateway(msg) => {
                warn!(%status, %msg, "upstream unavailable");
                (status, msg).into_response()
            }
            other => (status, other.to_string()).into_response(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<RequestError> for AppError {
    fn from(err: RequestError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        AppError::BadRequest(format!("invalid repository path: {err}"))
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized { challenge } => AppError::Unauthorized {
                message: "authentication required".into(),
                challenge,
            },
            AuthError::Forbidden => AppError::Forbidden("access denied".into()),
            AuthError::NotFound => AppError::NotFound("repository not found".into()),
            AuthError::Upstream(reason) => AppError::BadGateway(reason),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let message = err.to_string();
        match err {
            SyncError::Permanent { kind, .. } => match kind {
                PermanentKind::Unauthorized => AppError::Unauthorized {
                    message,
                    challenge: None,
                },
                PermanentKind::Forbidden => AppError::Forbidden(message),
                PermanentKind::NotFound => AppError::NotFound(message),
            },
            SyncError::Transient { .. } | SyncError::LockTimeout { .. } => {
                AppError::GatewayTimeout(message)
            }
            SyncError::Internal(reason) => AppError::Internal(anyhow::anyhow!(reason)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
