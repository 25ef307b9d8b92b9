//! Session scheduler - keeps the access token renewed in the background.
//!
//! While monitoring, three independent periodic tasks run:
//!
//! - **health check** (30s): verify the token; quick-refresh when it is close
//!   to expiry, full-refresh as recovery when it has expired or was rejected
//! - **fallback renewal** (240s): quick-refresh unconditionally, covering
//!   missed or drifted health checks
//! - **countdown** (1s): decrement the displayed remaining time
//!
//! The ticks are not mutually exclusive. Two guards keep overlapping work
//! safe: a single-flight slot coalesces concurrent refreshes into one network
//! call, and a generation counter (bumped on every start, stop and
//! termination) makes results from a previous run land nowhere.

mod single_flight;
mod tasks;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::api::{AuthBackend, RefreshKind};
use crate::auth::{AccessToken, CredentialKey, CredentialStore, RefreshToken, TokenGrant};
use crate::config::SessionTiming;
use crate::error::{Result, SessionError};

use single_flight::SingleFlight;
use tasks::TaskSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Monitoring,
    Refreshing,
    Terminated,
}

impl SchedulerState {
    pub fn is_running(&self) -> bool {
        matches!(self, SchedulerState::Monitoring | SchedulerState::Refreshing)
    }
}

/// Notifications sent up to the owner of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Refreshed {
        kind: RefreshKind,
        remaining_seconds: i64,
    },
    /// The session ended. `generation` is the scheduler generation the
    /// termination left behind; a later start or stop moves past it.
    Terminated {
        reason: SessionError,
        generation: u64,
    },
}

/// Outcome of one refresh call, shared by every coalesced caller.
#[derive(Debug, Clone)]
struct Renewal {
    grant: TokenGrant,
    /// False when the grant was older than the stored token and dropped
    applied: bool,
}

pub struct SessionScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn AuthBackend>,
    store: Arc<dyn CredentialStore>,
    timing: SessionTiming,
    state: watch::Sender<SchedulerState>,
    countdown: watch::Sender<Option<i64>>,
    /// Expiry of the authoritative token. Its lock also serializes
    /// generation changes against token writes.
    expires_at: Mutex<Option<DateTime<Utc>>>,
    generation: AtomicU64,
    inflight: SingleFlight<Result<Renewal>>,
    tasks: Mutex<Option<TaskSet>>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl SessionScheduler {
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        store: Arc<dyn CredentialStore>,
        timing: SessionTiming,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        let (countdown, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                backend,
                store,
                timing,
                state,
                countdown,
                expires_at: Mutex::new(None),
                generation: AtomicU64::new(0),
                inflight: SingleFlight::new(),
                tasks: Mutex::new(None),
                events,
            }),
        }
    }

    /// Move to `Monitoring` and start the three periodic tasks.
    ///
    /// Any previous run is torn down first. `expires_at` and `remaining` seed
    /// the countdown when known (after login); on resume both are `None`
    /// until the first health check reports.
    pub fn start(&self, expires_at: Option<DateTime<Utc>>, remaining: Option<i64>) {
        let inner = &self.inner;
        // Held for the whole transition so a concurrent termination either
        // completes before it or sees a newer generation and backs off
        let mut expiry = inner.lock_expiry();
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *expiry = expires_at;

        if let Some(previous) = inner.take_tasks() {
            previous.shutdown();
        }

        inner.countdown.send_replace(remaining.map(|secs| secs.max(0)));
        inner.state.send_replace(SchedulerState::Monitoring);

        let mut tasks = TaskSet::new();

        let health = Arc::clone(inner);
        tasks.spawn_periodic("health-check", inner.timing.health_check_period(), move || {
            let inner = Arc::clone(&health);
            async move { inner.health_check(generation).await }
        });

        let fallback = Arc::clone(inner);
        tasks.spawn_periodic(
            "fallback-renewal",
            inner.timing.fallback_refresh_period(),
            move || {
                let inner = Arc::clone(&fallback);
                async move { inner.fallback_refresh(generation).await }
            },
        );

        let countdown = Arc::clone(inner);
        tasks.spawn_periodic("countdown", inner.timing.countdown_period(), move || {
            countdown.tick_countdown();
            async {}
        });

        *inner.lock_tasks() = Some(tasks);
        drop(expiry);
        info!(generation, "Session monitoring started");
    }

    /// Tear down every periodic task and return to `Idle`.
    ///
    /// Refreshes still in flight finish, but their results are discarded.
    pub fn stop(&self) {
        let inner = &self.inner;
        let mut expiry = inner.lock_expiry();
        inner.generation.fetch_add(1, Ordering::SeqCst);
        *expiry = None;

        if let Some(tasks) = inner.take_tasks() {
            tasks.shutdown();
            debug!("Session monitoring stopped");
        }
        inner.countdown.send_replace(None);
        inner.state.send_replace(SchedulerState::Idle);
    }

    /// Refresh now, joining any refresh already in flight.
    pub async fn refresh(&self, kind: RefreshKind) -> Result<TokenGrant> {
        if !self.state().is_running() {
            return Err(SessionError::NotAuthenticated);
        }
        self.inner
            .refresh(kind, self.generation())
            .await
            .map(|renewal| renewal.grant)
    }

    /// Run one health-check tick immediately.
    pub async fn health_check(&self) {
        if self.state().is_running() {
            self.inner.health_check(self.generation()).await;
        }
    }

    /// Run one fallback-renewal tick immediately.
    pub async fn fallback_refresh(&self) {
        if self.state().is_running() {
            self.inner.fallback_refresh(self.generation()).await;
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.inner.state.subscribe()
    }

    /// Displayed remaining lifetime, if known. Cosmetic only.
    pub fn remaining_seconds(&self) -> Option<i64> {
        *self.inner.countdown.borrow()
    }

    pub fn subscribe_countdown(&self) -> watch::Receiver<Option<i64>> {
        self.inner.countdown.subscribe()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.lock_expiry()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn timing(&self) -> &SessionTiming {
        &self.inner.timing
    }
}

impl Drop for SessionScheduler {
    fn drop(&mut self) {
        if let Some(tasks) = self.inner.take_tasks() {
            tasks.shutdown();
        }
    }
}

impl Inner {
    fn lock_expiry(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.expires_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Option<TaskSet>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_tasks(&self) -> Option<TaskSet> {
        self.lock_tasks().take()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_countdown(&self, remaining: i64) {
        self.countdown.send_replace(Some(remaining.max(0)));
    }

    fn tick_countdown(&self) {
        let step = self.timing.countdown_period().as_secs() as i64;
        self.countdown.send_if_modified(|remaining| match remaining {
            Some(secs) if *secs > 0 => {
                *secs = (*secs - step).max(0);
                true
            }
            _ => false,
        });
    }

    fn current_access_token(&self) -> Result<AccessToken> {
        match self.store.get(CredentialKey::AccessToken)? {
            Some(raw) => AccessToken::parse(&raw),
            None => Err(SessionError::Unauthorized(
                "no access token stored".to_string(),
            )),
        }
    }

    fn current_refresh_token(&self) -> Result<RefreshToken> {
        match self.store.get(CredentialKey::RefreshToken)? {
            Some(raw) => RefreshToken::parse(&raw).map_err(|_| {
                SessionError::InvalidRefreshToken("stored refresh token is malformed".to_string())
            }),
            None => Err(SessionError::InvalidRefreshToken(
                "no refresh token stored".to_string(),
            )),
        }
    }

    async fn health_check(self: &Arc<Self>, generation: u64) {
        if !self.is_current(generation) {
            return;
        }

        let verified = match self.current_access_token() {
            Ok(token) => self.backend.verify(&token).await,
            Err(e) => Err(e),
        };

        if !self.is_current(generation) {
            debug!(generation, "Discarding verification from a previous run");
            return;
        }

        let info = match verified {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Token verification failed, treating token as expired");
                self.recover(generation).await;
                return;
            }
        };

        self.set_countdown(info.remaining_seconds);

        if info.remaining_seconds > self.timing.expiring_soon_secs {
            debug!(remaining = info.remaining_seconds, "Token healthy");
        } else if info.remaining_seconds > 0 {
            debug!(remaining = info.remaining_seconds, "Token expiring soon, quick refresh");
            if let Err(e) = self.refresh(RefreshKind::Quick, generation).await {
                warn!(error = %e, "Quick refresh failed, retrying on next tick");
            }
        } else {
            warn!("Token expired, attempting recovery refresh");
            self.recover(generation).await;
        }
    }

    async fn fallback_refresh(self: &Arc<Self>, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        debug!("Fallback renewal tick");
        if let Err(e) = self.refresh(RefreshKind::Quick, generation).await {
            warn!(error = %e, "Fallback renewal failed");
        }
    }

    /// Full refresh after detected expiry. Only a rejected refresh token
    /// ends the session; anything else waits for the next tick.
    async fn recover(self: &Arc<Self>, generation: u64) {
        match self.refresh(RefreshKind::Full, generation).await {
            Ok(Renewal {
                grant,
                applied: true,
            }) => {
                info!(remaining = grant.remaining_seconds, "Session recovered");
            }
            Ok(_) => {
                debug!("Recovery grant was older than the stored token");
            }
            Err(e) if e.is_fatal() => self.terminate(generation, e),
            Err(SessionError::NotAuthenticated) => {
                debug!(generation, "Recovery outcome belongs to a previous run");
            }
            Err(e) => {
                warn!(error = %e, "Recovery refresh failed, retrying on next tick");
            }
        }
    }

    async fn refresh(self: &Arc<Self>, kind: RefreshKind, generation: u64) -> Result<Renewal> {
        if !self.is_current(generation) {
            return Err(SessionError::NotAuthenticated);
        }

        let inner = Arc::clone(self);
        let (outcome, joined) = self
            .inflight
            .run(generation, move || async move {
                let refresh_token = inner.current_refresh_token()?;
                inner.execute_refresh(kind, refresh_token, generation).await
            })
            .await;

        if joined {
            debug!(kind = kind.label(), "Joined refresh already in flight");
        }
        outcome
    }

    async fn execute_refresh(
        &self,
        kind: RefreshKind,
        refresh_token: RefreshToken,
        generation: u64,
    ) -> Result<Renewal> {
        self.state.send_if_modified(|state| {
            if *state == SchedulerState::Monitoring {
                *state = SchedulerState::Refreshing;
                true
            } else {
                false
            }
        });
        debug!(kind = kind.label(), generation, "Refresh started");

        let outcome = match self.backend.refresh(kind, &refresh_token).await {
            Ok(grant) => self
                .apply_grant(kind, &grant, generation)
                .map(|applied| Renewal { grant, applied }),
            Err(e) => Err(e),
        };

        if self.is_current(generation) {
            self.state.send_if_modified(|state| {
                if *state == SchedulerState::Refreshing {
                    *state = SchedulerState::Monitoring;
                    true
                } else {
                    false
                }
            });
        }
        outcome
    }

    /// Make a grant authoritative, unless its run has ended or it is older
    /// than the token already stored. Returns whether it was applied.
    fn apply_grant(&self, kind: RefreshKind, grant: &TokenGrant, generation: u64) -> Result<bool> {
        let mut expiry = self.lock_expiry();
        if !self.is_current(generation) {
            debug!(generation, "Discarding refresh result from a previous run");
            return Err(SessionError::NotAuthenticated);
        }
        if let Some(current) = *expiry {
            if grant.expires_at < current {
                debug!(kind = kind.label(), "Discarding grant older than the current token");
                return Ok(false);
            }
        }

        self.store
            .set(CredentialKey::AccessToken, grant.access_token.as_str())?;
        *expiry = Some(grant.expires_at);
        self.set_countdown(grant.remaining_seconds);
        drop(expiry);

        info!(kind = kind.label(), remaining = grant.remaining_seconds, "Access token renewed");
        let _ = self.events.send(SchedulerEvent::Refreshed {
            kind,
            remaining_seconds: grant.remaining_seconds,
        });
        Ok(true)
    }

    /// Terminal transition: stop all ticks, clear credentials, tell the owner.
    ///
    /// Every effect happens under the expiry lock, so a login racing with
    /// this either lands afterwards or makes this run stale.
    fn terminate(&self, generation: u64, reason: SessionError) {
        let mut expiry = self.lock_expiry();
        if !self.is_current(generation) {
            return;
        }
        let terminated = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *expiry = None;

        // May be running inside one of these tasks, so cancel rather than abort
        if let Some(tasks) = self.take_tasks() {
            tasks.cancel();
        }
        if let Err(e) = self.store.clear() {
            error!(error = %e, "Failed to clear credentials after termination");
        }
        self.countdown.send_replace(Some(0));
        self.state.send_replace(SchedulerState::Terminated);
        drop(expiry);

        error!(error = %reason, "Session terminated");
        let _ = self.events.send(SchedulerEvent::Terminated {
            reason,
            generation: terminated,
        });
    }
}
