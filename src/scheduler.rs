//! Periodic and on-demand sync of all configured endpoints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto::Crypto;
use crate::endpoint::{Endpoint, EndpointEdit, EndpointId, EndpointStore};
use crate::error::{Error, ImportError, Result};
use crate::fetch::{ConnectivityCheck, internet_available};
use crate::types::{RunState, StatusEvent, VerifierState, VerifyProgress};
use crate::validation::Fingerprint;
use crate::verifier::{VerificationResult, Verifier};

/// Options for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// How long after its last check an endpoint is synced again.
    pub interval: Duration,
    /// How often the background loop looks for due endpoints.
    pub tick: Duration,
    /// Connectivity check run before each scheduled tick. `None` disables it.
    pub connectivity_check: Option<ConnectivityCheck>,
    /// Buffered status events per subscriber before old ones are dropped.
    pub event_capacity: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            tick: Duration::from_secs(60),
            connectivity_check: Some(ConnectivityCheck::default()),
            event_capacity: 64,
        }
    }
}

/// Result of asking for a run.
#[derive(Debug)]
pub enum TriggerOutcome {
    Started(JoinHandle<VerificationResult>),
    /// A run for this endpoint is already in flight; nothing was started.
    AlreadyRunning,
    UnknownEndpoint,
}

type InFlight = Arc<Mutex<HashMap<EndpointId, CancellationToken>>>;

/// Exclusive right to run one endpoint. Released on drop.
struct RunClaim {
    id: EndpointId,
    token: CancellationToken,
    in_flight: InFlight,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Drives [`Verifier`] runs for every endpoint in an [`EndpointStore`].
///
/// At most one run per endpoint is in flight at any time; further triggers
/// for it are coalesced. Progress is published as [`StatusEvent`]s.
pub struct Scheduler {
    verifier: Arc<Verifier>,
    store: Arc<EndpointStore>,
    in_flight: InFlight,
    events: broadcast::Sender<StatusEvent>,
    shutdown: CancellationToken,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(verifier: Arc<Verifier>, store: Arc<EndpointStore>) -> Arc<Self> {
        Self::with_options(verifier, store, SchedulerOptions::default())
    }

    pub fn with_options(
        verifier: Arc<Verifier>,
        store: Arc<EndpointStore>,
        options: SchedulerOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Arc::new(Self {
            verifier,
            store,
            in_flight: Arc::default(),
            events,
            shutdown: CancellationToken::new(),
            options,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<EndpointStore> {
        &self.store
    }

    pub fn is_running(&self, id: EndpointId) -> bool {
        self.lock_in_flight().contains_key(&id)
    }

    /// Cancels the in-flight run for `id`. Returns false if none was running.
    pub fn cancel(&self, id: EndpointId) -> bool {
        match self.lock_in_flight().get(&id) {
            Some(token) => {
                info!(endpoint = %id, "cancelling sync");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops the background loop and cancels every in-flight run.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Starts a background run for `id` unless one is already in flight.
    pub fn trigger(self: &Arc<Self>, id: EndpointId) -> TriggerOutcome {
        let Some(endpoint) = self.store.get(id) else {
            return TriggerOutcome::UnknownEndpoint;
        };
        let Some(claim) = self.claim(id) else {
            debug!(endpoint = %id, "sync already running, coalescing trigger");
            return TriggerOutcome::AlreadyRunning;
        };

        let this = Arc::clone(self);
        TriggerOutcome::Started(tokio::spawn(
            async move { this.execute(endpoint, claim).await },
        ))
    }

    /// Runs `id` now and waits for it. `Ok(None)` if a run was already in
    /// flight.
    pub async fn sync_now(&self, id: EndpointId) -> Result<Option<VerificationResult>> {
        let endpoint = self
            .store
            .get(id)
            .ok_or_else(|| Error::UnknownEndpoint(id.to_string()))?;
        let Some(claim) = self.claim(id) else {
            return Ok(None);
        };
        Ok(Some(self.execute(endpoint, claim).await))
    }

    /// Starts runs for every endpoint that is due.
    ///
    /// If the connectivity check fails, no run is started and each due
    /// endpoint gets a [`RunState::Deferred`] event instead.
    pub async fn tick(self: &Arc<Self>) -> Vec<JoinHandle<VerificationResult>> {
        let snapshot = self.store.snapshot();
        let interval = TimeDelta::from_std(self.options.interval).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();
        let due: Vec<EndpointId> = snapshot
            .endpoints()
            .iter()
            .filter(|e| e.last_checked().is_none_or(|at| now - at >= interval))
            .map(Endpoint::id)
            .collect();

        if due.is_empty() {
            return Vec::new();
        }

        if let Some(check) = &self.options.connectivity_check
            && !internet_available(check).await
        {
            info!(endpoints = due.len(), "network unavailable, deferring sync");
            for id in due {
                self.emit(id, RunState::Deferred, "Waiting for a network connection");
            }
            return Vec::new();
        }

        due.into_iter()
            .filter_map(|id| match self.trigger(id) {
                TriggerOutcome::Started(handle) => Some(handle),
                _ => None,
            })
            .collect()
    }

    /// Spawns the periodic loop. It runs until [`Scheduler::shutdown`].
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.options.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?this.options.interval, "scheduler started");

            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        this.tick().await;
                    }
                }
            }
            info!("scheduler stopped");
        })
    }

    /// Verifies a new endpoint and saves it only if the run succeeds.
    ///
    /// The authority key is then saved to the local key cache. A failure to
    /// do so is logged and does not fail the add.
    pub async fn add_endpoint(&self, mut endpoint: Endpoint) -> Result<VerificationResult> {
        let snapshot = self.store.snapshot();
        if snapshot
            .endpoints()
            .iter()
            .any(|e| e.authority_fingerprint() == endpoint.authority_fingerprint())
        {
            return Err(Error::DuplicateEndpoint(
                endpoint.authority_fingerprint().to_string(),
            ));
        }

        let Some(claim) = self.claim(endpoint.id()) else {
            return Err(Error::SyncInProgress(endpoint.id().to_string()));
        };
        let result = self.verify_candidate(&endpoint, &claim.token).await?;
        endpoint.record(&result);
        let fingerprint = endpoint.authority_fingerprint().clone();
        self.store.insert(endpoint)?;
        drop(claim);

        if let Err(error) = self.verifier.crypto().save_key(&fingerprint).await {
            warn!(%fingerprint, %error, "could not save authority key to cache");
        }
        Ok(result)
    }

    /// Applies `edit` to endpoint `id`.
    ///
    /// A new keylist URL is verified first and only saved if that run
    /// succeeds; the verification result is returned. Other edits are
    /// saved directly. Either way the edit is applied to the stored record
    /// at the moment of writing, so bookkeeping from a run that finished in
    /// the meantime is kept.
    pub async fn edit_endpoint(
        &self,
        id: EndpointId,
        edit: &EndpointEdit,
    ) -> Result<Option<VerificationResult>> {
        let current = self
            .store
            .get(id)
            .ok_or_else(|| Error::UnknownEndpoint(id.to_string()))?;
        let (candidate, needs_verify) = current.apply_edit(edit)?;

        if !needs_verify {
            self.store.edit(id, |live| match live.apply_edit(edit)? {
                (updated, false) => Ok(updated),
                (_, true) => Err(Error::EditConflict(id.to_string())),
            })?;
            return Ok(None);
        }

        let Some(claim) = self.claim(id) else {
            return Err(Error::SyncInProgress(id.to_string()));
        };
        let result = self.verify_candidate(&candidate, &claim.token).await?;
        self.store.edit(id, |live| {
            let (mut updated, _) = live.apply_edit(edit)?;
            if updated.keyserver() != candidate.keyserver() || updated.proxy() != candidate.proxy() {
                return Err(Error::EditConflict(id.to_string()));
            }
            updated.record(&result);
            Ok(updated)
        })?;
        Ok(Some(result))
    }

    /// Cancels any run for `id` and removes it.
    pub fn delete_endpoint(&self, id: EndpointId) -> Result<Endpoint> {
        self.cancel(id);
        self.store.remove(id)
    }

    async fn verify_candidate(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<VerificationResult> {
        let result = self.verifier.run(endpoint, cancel, |_| {}).await;
        if result.is_success() {
            Ok(result)
        } else {
            Err(Error::VerificationFailed(result.status_message()))
        }
    }

    fn claim(&self, id: EndpointId) -> Option<RunClaim> {
        let mut in_flight = self.lock_in_flight();
        if in_flight.contains_key(&id) {
            return None;
        }
        let token = self.shutdown.child_token();
        in_flight.insert(id, token.clone());
        Some(RunClaim {
            id,
            token,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    async fn execute(&self, endpoint: Endpoint, claim: RunClaim) -> VerificationResult {
        let id = endpoint.id();
        self.emit(id, RunState::Started, "Syncing");

        let events = self.events.clone();
        let result = self
            .verifier
            .run(&endpoint, &claim.token, move |progress| {
                let event = match progress {
                    VerifyProgress::State(state) => {
                        StatusEvent::new(id, RunState::Progress(state), state.to_string())
                    }
                    VerifyProgress::MemberKey { current, total, .. } => StatusEvent::new(
                        id,
                        RunState::Progress(VerifierState::FetchingMemberKeys),
                        format!("Fetching key {current} of {total}"),
                    ),
                };
                let _ = events.send(event);
            })
            .await;

        if let Err(error) = self.store.record_result(&result) {
            warn!(endpoint = %id, %error, "could not record sync result");
        }

        let state = if result.is_cancelled() {
            RunState::Cancelled
        } else if result.is_success() {
            RunState::Succeeded
        } else {
            RunState::Failed
        };
        self.emit(id, state, result.status_message());
        drop(claim);
        result
    }

    fn emit(&self, id: EndpointId, state: RunState, message: impl Into<String>) {
        // No subscribers is fine.
        let _ = self.events.send(StatusEvent::new(id, state, message));
    }

    fn lock_in_flight(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<EndpointId, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of [`warm_cache`].
#[derive(Debug, Default)]
pub struct WarmCacheReport {
    pub imported: Vec<Fingerprint>,
    pub failed: Vec<(Fingerprint, ImportError)>,
}

/// Imports every endpoint's authority key from the local key cache.
///
/// Failures are logged and reported, never fatal.
pub async fn warm_cache(crypto: &dyn Crypto, endpoints: &[Endpoint]) -> WarmCacheReport {
    let mut report = WarmCacheReport::default();
    for endpoint in endpoints {
        let fingerprint = endpoint.authority_fingerprint();
        match crypto.import_key(fingerprint).await {
            Ok(_) => report.imported.push(fingerprint.clone()),
            Err(error) => {
                warn!(%fingerprint, %error, "could not import cached authority key");
                report.failed.push((fingerprint.clone(), error));
            }
        }
    }
    info!(
        imported = report.imported.len(),
        failed = report.failed.len(),
        "warmed key cache"
    );
    report
}

/// Fails with [`Error::ToolUnavailable`] unless GnuPG 2.x can be used.
pub async fn ensure_available(crypto: &dyn Crypto) -> Result<()> {
    if crypto.is_available().await {
        Ok(())
    } else {
        Err(Error::ToolUnavailable)
    }
}
