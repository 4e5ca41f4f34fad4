//! Per-request context for smart-HTTP traffic.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::RepositoryIdentity;
use crate::credentials::Credentials;
use crate::metrics::Operation;

pub const UPLOAD_PACK: &str = "git-upload-pack";
pub const RECEIVE_PACK: &str = "git-receive-pack";

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    pub fn name(self) -> &'static str {
        match self {
            Self::UploadPack => UPLOAD_PACK,
            Self::ReceivePack => RECEIVE_PACK,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            UPLOAD_PACK => Some(Self::UploadPack),
            RECEIVE_PACK => Some(Self::ReceivePack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitRequest {
    /// `GET …/info/refs?service=…`
    Discovery(Service),
    /// `POST …/git-upload-pack` or `POST …/git-receive-pack`
    Rpc(Service),
}

impl GitRequest {
    pub fn service(self) -> Service {
        match self {
            Self::Discovery(s) | Self::Rpc(s) => s,
        }
    }

    pub fn operation(self) -> Operation {
        match self {
            Self::Discovery(Service::UploadPack) => Operation::InfoRefs,
            Self::Rpc(Service::UploadPack) => Operation::UploadPack,
            Self::Discovery(Service::ReceivePack) | Self::Rpc(Service::ReceivePack) => {
                Operation::ReceivePack
            }
        }
    }

    pub fn content_type(self) -> String {
        match self {
            Self::Discovery(s) => format!("application/x-{}-advertisement", s.name()),
            Self::Rpc(s) => format!("application/x-{}-result", s.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unsupported service: {0}")]
    UnsupportedService(String),
}

/// Split a request into the repository path and the git operation.
pub fn parse_request(
    is_post: bool,
    path: &str,
    query: Option<&str>,
) -> Result<(String, GitRequest), RequestError> {
    let path = path.trim_start_matches('/');

    let (repo, request) = if let Some(repo) = path.strip_suffix("/info/refs") {
        if is_post {
            return Err(RequestError::Malformed("info/refs must be fetched with GET".into()));
        }
        let service = query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .find_map(|pair| pair.strip_prefix("service="))
            .ok_or_else(|| RequestError::Malformed("dumb HTTP is not supported".into()))?;
        let service = Service::from_name(service)
            .ok_or_else(|| RequestError::UnsupportedService(service.to_string()))?;
        (repo, GitRequest::Discovery(service))
    } else if let Some((repo, last)) = path.rsplit_once('/') {
        let service = Service::from_name(last)
            .ok_or_else(|| RequestError::Malformed(format!("unknown endpoint /{path}")))?;
        if !is_post {
            return Err(RequestError::Malformed(format!("{last} must be called with POST")));
        }
        (repo, GitRequest::Rpc(service))
    } else {
        return Err(RequestError::Malformed(format!("unknown endpoint /{path}")));
    };

    if repo.trim_matches('/').is_empty() {
        return Err(RequestError::Malformed("missing repository path".into()));
    }
    Ok((repo.to_string(), request))
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Start,
    Resolving,
    Refreshing,
    Serving,
    Done,
    Failed(String),
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            Self::Start => 0,
            Self::Resolving => 1,
            Self::Refreshing => 2,
            Self::Serving => 3,
            Self::Done | Self::Failed(_) => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Resolving => f.write_str("resolving"),
            Self::Refreshing => f.write_str("refreshing"),
            Self::Serving => f.write_str("serving"),
            Self::Done => f.write_str("done"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// One client request, from arrival until its response is complete.
pub struct ClientSession {
    pub id: uuid::Uuid,
    pub identity: Option<RepositoryIdentity>,
    pub request: Option<GitRequest>,
    /// Raw `Git-Protocol` header.
    pub protocol: Option<String>,
    pub authorization: Option<String>,
    pub started: Instant,
    pub deadline: Instant,
    state: SessionState,
}

impl ClientSession {
    pub fn new(timeout: Duration, protocol: Option<String>, authorization: Option<String>) -> Self {
        let started = Instant::now();
        Self {
            id: uuid::Uuid::new_v4(),
            identity: None,
            request: None,
            protocol,
            authorization,
            started,
            deadline: started + timeout,
            state: SessionState::Start,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Move forward to `next`.  Backward moves and moves out of a terminal
    /// state are ignored.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            warn!(session = %self.id, from = %self.state, to = %next, "ignoring session state change");
            return false;
        }
        debug!(
            session = %self.id,
            from = %self.state,
            to = %next,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "session state"
        );
        self.state = next;
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        self.advance(SessionState::Failed(reason.into()))
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Protocol version requested through `Git-Protocol`, 0 when absent.
    pub fn protocol_version(&self) -> u8 {
        self.protocol
            .as_deref()
            .into_iter()
            .flat_map(|p| p.split(':'))
            .filter_map(|kv| kv.trim().strip_prefix("version="))
            .filter_map(|v| v.parse().ok())
            .max()
            .unwrap_or(0)
    }

    /// Credentials to use against upstream on this client's behalf.
    pub fn credentials(&self) -> Option<Credentials> {
        self.authorization
            .as_deref()
            .and_then(Credentials::from_authorization)
    }
}
