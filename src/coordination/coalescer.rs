//! Collapse concurrent refreshes of the same mirror into one sync.
//!
//! The first request that finds a mirror stale becomes the leader: it spawns
//! a refresh task and publishes the result on a ticket.  Requests arriving
//! while the ticket is live wait on it instead of starting their own sync.
//! The refresh runs detached from any request, so a client that goes away
//! does not cancel the sync for everybody else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, instrument, warn};

use crate::cache::{MirrorRecord, MirrorStore, RepositoryIdentity};
use crate::coordination::locks::{LockError, LockTimeouts, RepoLock};
use crate::credentials::Credentials;
use crate::metrics::{CacheLabels, CacheResult, Metrics};
use crate::sync::{MirrorSync, SyncError, SyncReport};

/// How a request got its fresh mirror.
#[derive(Debug, Clone)]
pub enum Freshness {
    /// The mirror was already fresh.
    Hit,
    /// A sync ran on behalf of this request (or one it joined).
    Synced(SyncReport),
    /// Another worker refreshed the mirror while we waited for its lock.
    RefreshedElsewhere,
}

#[derive(Debug, Clone)]
pub struct EnsureOutcome {
    pub record: MirrorRecord,
    pub freshness: Freshness,
    /// The request waited on a refresh started by another request.
    pub coalesced: bool,
}

type RefreshResult = Result<Freshness, SyncError>;

/// One in-flight refresh.  The value is set exactly once.
struct Ticket {
    started: DateTime<Utc>,
    result: watch::Receiver<Option<RefreshResult>>,
}

#[derive(Clone)]
pub struct RequestCoalescer {
    store: Arc<MirrorStore>,
    syncer: Arc<dyn MirrorSync>,
    lock_timeouts: LockTimeouts,
    metrics: Arc<Metrics>,
    tickets: Arc<Mutex<HashMap<RepositoryIdentity, Arc<Ticket>>>>,
}

impl RequestCoalescer {
    pub fn new(
        store: Arc<MirrorStore>,
        syncer: Arc<dyn MirrorSync>,
        lock_timeouts: LockTimeouts,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            syncer,
            lock_timeouts,
            metrics,
            tickets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of refreshes currently in flight.
    pub fn in_flight(&self) -> usize {
        self.tickets.lock().len()
    }

    /// Return a mirror that is fresh within `max_age`, syncing it if needed.
    ///
    /// With `force` the freshness window is ignored and a sync always happens
    /// unless one completed after this call started.
    #[instrument(skip(self, credentials), fields(repo = %identity))]
    pub async fn ensure_fresh(
        &self,
        identity: &RepositoryIdentity,
        max_age: Duration,
        force: bool,
        credentials: Option<Credentials>,
    ) -> Result<EnsureOutcome, SyncError> {
        let record = self
            .store
            .get_or_create(identity)
            .await
            .map_err(SyncError::internal)?;

        if !force && record.is_fresh_at(max_age, Utc::now()) {
            self.record_cache(CacheResult::Hit);
            return Ok(EnsureOutcome {
                record,
                freshness: Freshness::Hit,
                coalesced: false,
            });
        }
        self.record_cache(CacheResult::Miss);

        let (ticket, coalesced) = self.join_or_lead(identity, max_age, force, credentials);
        if coalesced {
            self.metrics.coalesced_requests.inc();
            debug!("joined refresh already in flight");
        }

        let freshness = wait_for(&ticket).await?;
        let record = self
            .store
            .get_or_create(identity)
            .await
            .map_err(SyncError::internal)?;
        Ok(EnsureOutcome {
            record,
            freshness,
            coalesced,
        })
    }

    fn record_cache(&self, result: CacheResult) {
        self.metrics
            .cache_requests
            .get_or_create(&CacheLabels { result })
            .inc();
    }

    /// Return the live ticket for `identity`, spawning a refresh if there is
    /// none.  The flag is true when an existing ticket was joined.
    fn join_or_lead(
        &self,
        identity: &RepositoryIdentity,
        max_age: Duration,
        force: bool,
        credentials: Option<Credentials>,
    ) -> (Arc<Ticket>, bool) {
        let mut tickets = self.tickets.lock();
        if let Some(ticket) = tickets.get(identity) {
            return (ticket.clone(), true);
        }

        let (tx, rx) = watch::channel(None);
        let ticket = Arc::new(Ticket {
            started: Utc::now(),
            result: rx,
        });
        tickets.insert(identity.clone(), ticket.clone());
        drop(tickets);

        let this = self.clone();
        let identity = identity.clone();
        let leader_ticket = ticket.clone();
        tokio::spawn(async move {
            let result = this
                .refresh(&identity, leader_ticket.started, max_age, force, credentials)
                .await;
            if let Err(e) = &result {
                warn!(repo = %identity, error = %e, "mirror refresh failed");
            }
            tx.send_replace(Some(result));
            this.retire(&identity, &leader_ticket);
        });

        (ticket, false)
    }

    fn retire(&self, identity: &RepositoryIdentity, ticket: &Arc<Ticket>) {
        let mut tickets = self.tickets.lock();
        if tickets
            .get(identity)
            .is_some_and(|current| Arc::ptr_eq(current, ticket))
        {
            tickets.remove(identity);
        }
    }

    async fn refresh(
        &self,
        identity: &RepositoryIdentity,
        requested_at: DateTime<Utc>,
        max_age: Duration,
        force: bool,
        credentials: Option<Credentials>,
    ) -> RefreshResult {
        let record = self
            .store
            .get_or_create(identity)
            .await
            .map_err(SyncError::internal)?;
        let lock = RepoLock::new(record.lock_path(), self.lock_timeouts);
        let guard = match lock.acquire().await {
            Ok(guard) => guard,
            Err(LockError::Timeout { waited, .. }) => {
                self.metrics.lock_timeouts.inc();
                return Err(SyncError::LockTimeout { waited });
            }
            Err(LockError::Io(e)) => return Err(SyncError::internal(e)),
        };
        self.metrics.lock_acquisitions.inc();
        if guard.reclaimed_stale() {
            self.metrics.lock_reclaims.inc();
        }

        // Someone may have synced while we waited for the lock.
        let current = match self.store.get(identity).await {
            Some(current) => current,
            None => self
                .store
                .get_or_create(identity)
                .await
                .map_err(SyncError::internal)?,
        };
        if current.in_progress() {
            warn!("previous sync of this mirror never finished");
        }
        let synced_since_request = current
            .meta
            .last_success
            .is_some_and(|success| success >= requested_at);
        if synced_since_request || (!force && current.is_fresh_at(max_age, Utc::now())) {
            debug!("mirror refreshed by another worker");
            return Ok(Freshness::RefreshedElsewhere);
        }

        if let Err(e) = self.store.mark_sync_started(identity).await {
            error!(error = %e, "failed to record sync start");
        }
        let report = self
            .syncer
            .sync(identity, &current.repo_path(), credentials.as_ref())
            .await?;
        debug!(held_ms = guard.held_for().as_millis() as u64, "sync finished under lock");
        Ok(Freshness::Synced(report))
    }
}

async fn wait_for(ticket: &Ticket) -> RefreshResult {
    let mut rx = ticket.result.clone();
    let value = match rx.wait_for(Option::is_some).await {
        Ok(value) => (*value).clone(),
        Err(_) => None,
    };
    value.unwrap_or_else(|| Err(SyncError::Internal("refresh task ended without a result".into())))
}
