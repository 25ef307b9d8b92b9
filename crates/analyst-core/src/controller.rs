//! Session controller - the entry point the UI talks to.
//!
//! Owns the scheduler and the credential store, turns login, resume and
//! logout into scheduler transitions, and reports what happened through a
//! broadcast stream of `SessionEvent`s.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::AuthBackend;
use crate::auth::{AccessToken, CredentialKey, CredentialStore, Credentials, SessionState, User};
use crate::config::SessionTiming;
use crate::error::{Result, SessionError};
use crate::scheduler::{SchedulerEvent, SchedulerState, SessionScheduler};

/// Notice shown between termination and the redirect.
pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired. Please sign in again.";

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LoggedIn { user: User },
    Refreshed { remaining_seconds: i64 },
    /// The session ended on its own; a `Redirect` follows after a delay.
    Expired { message: String },
    /// Navigate to the sign-in entry point.
    Redirect,
    LoggedOut,
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    backend: Arc<dyn AuthBackend>,
    store: Arc<dyn CredentialStore>,
    scheduler: SessionScheduler,
    events: broadcast::Sender<SessionEvent>,
    redirect: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Build the controller and its supervisor task. Must be called from
    /// within a Tokio runtime.
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        store: Arc<dyn CredentialStore>,
        timing: SessionTiming,
    ) -> Self {
        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let scheduler = SessionScheduler::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            timing,
            scheduler_tx,
        );

        let inner = Arc::new(ControllerInner {
            backend,
            store,
            scheduler,
            events,
            redirect: Mutex::new(None),
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), scheduler_rx));

        Self { inner }
    }

    /// Authenticate, persist the session and start monitoring it.
    pub async fn login(&self, credentials: &Credentials) -> Result<User> {
        let inner = &self.inner;
        inner.cancel_redirect();

        let session = inner.backend.login(credentials).await?;

        inner.scheduler.stop();
        let persisted = inner.persist(
            &session.access_token,
            session.refresh_token.as_str(),
            &session.user,
        );
        if let Err(e) = persisted {
            error!(error = %e, "Failed to persist session");
            if let Err(clear_err) = inner.store.clear() {
                warn!(error = %clear_err, "Failed to clear partially written credentials");
            }
            return Err(e);
        }

        inner
            .scheduler
            .start(Some(session.expires_at), Some(session.remaining_seconds()));

        info!(user = %session.user.username, "Logged in");
        let _ = inner.events.send(SessionEvent::LoggedIn {
            user: session.user.clone(),
        });
        Ok(session.user)
    }

    /// Pick up a stored session on application start.
    ///
    /// Returns whether a session is now being monitored. A malformed stored
    /// token is removed, and a terminated session is never resumed.
    pub fn resume(&self) -> Result<bool> {
        let inner = &self.inner;
        match inner.scheduler.state() {
            SchedulerState::Terminated => {
                debug!("Not resuming a terminated session");
                return Ok(false);
            }
            state if state.is_running() => return Ok(true),
            _ => {}
        }

        let Some(raw) = inner.store.get(CredentialKey::AccessToken)? else {
            debug!("No stored session to resume");
            return Ok(false);
        };
        if let Err(e) = AccessToken::parse(&raw) {
            warn!(error = %e, "Stored access token is malformed, clearing session");
            inner.store.clear()?;
            return Ok(false);
        }

        inner.scheduler.start(None, None);
        info!("Resumed stored session");
        Ok(true)
    }

    /// Stop monitoring, forget the credentials and return to sign-in.
    pub fn logout(&self) -> Result<()> {
        let inner = &self.inner;
        inner.cancel_redirect();
        inner.scheduler.stop();
        inner.store.clear()?;

        info!("Logged out");
        let _ = inner.events.send(SessionEvent::LoggedOut);
        let _ = inner.events.send(SessionEvent::Redirect);
        Ok(())
    }

    /// Displayed remaining lifetime. Zero when unknown; never authoritative.
    pub fn current_remaining_seconds(&self) -> i64 {
        self.inner.scheduler.remaining_seconds().unwrap_or(0)
    }

    pub fn session_state(&self) -> SessionState {
        let scheduler = &self.inner.scheduler;
        match scheduler.state() {
            SchedulerState::Idle => SessionState::Unauthenticated,
            SchedulerState::Terminated => SessionState::Terminated,
            SchedulerState::Monitoring | SchedulerState::Refreshing => {
                match scheduler.remaining_seconds() {
                    Some(remaining) => {
                        SessionState::classify(remaining, scheduler.timing().expiring_soon_secs)
                    }
                    None => SessionState::Active,
                }
            }
        }
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.inner.scheduler.state()
    }

    /// The signed-in user, as persisted at login.
    pub fn user(&self) -> Result<Option<User>> {
        match self.inner.store.get(CredentialKey::User)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_countdown(&self) -> watch::Receiver<Option<i64>> {
        self.inner.scheduler.subscribe_countdown()
    }

    pub fn scheduler(&self) -> &SessionScheduler {
        &self.inner.scheduler
    }
}

impl ControllerInner {
    fn lock_redirect(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.redirect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cancel_redirect(&self) {
        if let Some(pending) = self.lock_redirect().take() {
            pending.abort();
        }
    }

    fn persist(&self, access_token: &AccessToken, refresh_token: &str, user: &User) -> Result<()> {
        self.store
            .set(CredentialKey::AccessToken, access_token.as_str())?;
        self.store.set(CredentialKey::RefreshToken, refresh_token)?;
        self.store
            .set(CredentialKey::User, &serde_json::to_string(user)?)?;
        Ok(())
    }

    /// Logout cascade after the scheduler gave up on the session.
    ///
    /// The scheduler has already cleared the store; this only tells the UI.
    fn expire(&self, reason: &SessionError, generation: u64) {
        // A login may have replaced the session since the event was sent
        if self.scheduler.generation() != generation {
            debug!(generation, "Ignoring termination of a replaced session");
            return;
        }

        warn!(reason = %reason, "Session expired");
        let _ = self.events.send(SessionEvent::Expired {
            message: SESSION_EXPIRED_MESSAGE.to_string(),
        });

        let events = self.events.clone();
        let delay = self.scheduler.timing().redirect_delay();
        let pending = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::Redirect);
        });
        if let Some(previous) = self.lock_redirect().replace(pending) {
            previous.abort();
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.cancel_redirect();
    }
}

/// Forward scheduler events until the controller or scheduler goes away.
async fn supervise(
    controller: Weak<ControllerInner>,
    mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = controller.upgrade() else {
            break;
        };
        match event {
            SchedulerEvent::Refreshed {
                remaining_seconds, ..
            } => {
                let _ = inner.events.send(SessionEvent::Refreshed { remaining_seconds });
            }
            SchedulerEvent::Terminated { reason, generation } => {
                inner.expire(&reason, generation)
            }
        }
    }
    debug!("Session supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RefreshKind;
    use crate::auth::MemoryStore;
    use crate::tests::fakes::{token, user, Call, FakeBackend};
    use std::time::Duration;
    use tokio::time::{sleep, sleep_until, Instant};

    struct Harness {
        backend: Arc<FakeBackend>,
        store: Arc<MemoryStore>,
        controller: SessionController,
    }

    fn harness_with(timing: SessionTiming) -> Harness {
        let backend = FakeBackend::new();
        let store = Arc::new(MemoryStore::new());
        let controller = SessionController::new(backend.clone(), store.clone(), timing);
        Harness {
            backend,
            store,
            controller,
        }
    }

    fn harness() -> Harness {
        harness_with(SessionTiming::default())
    }

    fn credentials() -> Credentials {
        Credentials::new("analyst", "correct horse")
    }

    async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        events.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_persists_session_and_starts_monitoring() {
        let h = harness();
        let mut events = h.controller.subscribe();

        let signed_in = h.controller.login(&credentials()).await.unwrap();

        assert_eq!(signed_in, user());
        assert_eq!(h.controller.scheduler_state(), SchedulerState::Monitoring);
        assert_eq!(h.controller.session_state(), SessionState::Active);
        assert!((899..=900).contains(&h.controller.current_remaining_seconds()));
        assert!(h.store.get(CredentialKey::AccessToken).unwrap().is_some());
        assert_eq!(
            h.store.get(CredentialKey::RefreshToken).unwrap().as_deref(),
            Some("refresh-1")
        );
        assert_eq!(h.controller.user().unwrap(), Some(user()));
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::LoggedIn { user: user() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_session_is_left_alone() {
        let h = harness();
        h.controller.login(&credentials()).await.unwrap();
        h.backend.push_verify_remaining(890);

        sleep(Duration::from_millis(30_500)).await;

        assert_eq!(h.backend.count(Call::Verify), 1);
        assert_eq!(h.backend.refresh_calls(), 0);
        // the countdown may already have ticked once past the report
        assert!((889..=890).contains(&h.controller.current_remaining_seconds()));
        assert_eq!(h.controller.session_state(), SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiring_session_quick_refreshes_and_countdown_restarts() {
        let timing = SessionTiming {
            fallback_refresh_secs: 3600,
            ..SessionTiming::default()
        };
        let h = harness_with(timing);
        let start = Instant::now();
        h.controller.login(&credentials()).await.unwrap();
        h.backend.verify_remaining(890);

        sleep_until(start + Duration::from_secs(865)).await;
        assert_eq!(h.backend.refresh_calls(), 0);
        h.backend.push_verify_remaining(30);

        sleep_until(start + Duration::from_millis(870_500)).await;
        assert_eq!(h.backend.count(Call::Refresh(RefreshKind::Quick)), 1);
        assert_eq!(h.backend.count(Call::Refresh(RefreshKind::Full)), 0);
        assert!((899..=900).contains(&h.controller.current_remaining_seconds()));
        assert_eq!(h.controller.scheduler_state(), SchedulerState::Monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_refresh_token_expires_session_and_redirects() {
        let h = harness();
        let start = Instant::now();
        h.controller.login(&credentials()).await.unwrap();
        let mut events = h.controller.subscribe();

        h.backend
            .push_verify(Err(SessionError::Unauthorized("token expired".into())));
        h.backend
            .fail_refresh(SessionError::InvalidRefreshToken("revoked".into()));

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Expired {
                message: SESSION_EXPIRED_MESSAGE.to_string()
            }
        );
        assert_eq!(h.controller.current_remaining_seconds(), 0);
        assert_eq!(h.controller.session_state(), SessionState::Terminated);
        for key in CredentialKey::ALL {
            assert_eq!(h.store.get(key).unwrap(), None);
        }

        assert_eq!(next_event(&mut events).await, SessionEvent::Redirect);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(31) && elapsed <= Duration::from_secs(34));
        assert_eq!(h.backend.count(Call::Refresh(RefreshKind::Full)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_with_expired_token_recovers() {
        let h = harness();
        h.store
            .set(CredentialKey::AccessToken, &token("stale"))
            .unwrap();
        h.store.set(CredentialKey::RefreshToken, "refresh-1").unwrap();
        h.backend
            .push_verify(Err(SessionError::Unauthorized("token expired".into())));
        let mut events = h.controller.subscribe();

        assert!(h.controller.resume().unwrap());
        assert_eq!(h.controller.current_remaining_seconds(), 0);
        assert_eq!(h.controller.session_state(), SessionState::Active);

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Refreshed {
                remaining_seconds: 900
            }
        );
        assert_eq!(h.backend.count(Call::Refresh(RefreshKind::Full)), 1);
        assert_eq!(h.controller.scheduler_state(), SchedulerState::Monitoring);
        assert_ne!(
            h.store.get(CredentialKey::AccessToken).unwrap(),
            Some(token("stale"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_without_stored_token() {
        let h = harness();
        assert!(!h.controller.resume().unwrap());
        assert_eq!(h.controller.scheduler_state(), SchedulerState::Idle);
        assert_eq!(h.controller.session_state(), SessionState::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_clears_malformed_token() {
        let h = harness();
        h.store.put(CredentialKey::AccessToken, "not-a-jwt").unwrap();
        h.store.put(CredentialKey::RefreshToken, "refresh-1").unwrap();

        assert!(!h.controller.resume().unwrap());
        assert_eq!(h.store.get(CredentialKey::AccessToken).unwrap(), None);
        assert_eq!(h.store.get(CredentialKey::RefreshToken).unwrap(), None);
        assert_eq!(h.controller.scheduler_state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_is_idempotent_while_monitoring() {
        let h = harness();
        h.controller.login(&credentials()).await.unwrap();
        let generation = h.controller.scheduler().generation();

        assert!(h.controller.resume().unwrap());
        assert_eq!(h.controller.scheduler().generation(), generation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_clears_everything() {
        let h = harness();
        h.controller.login(&credentials()).await.unwrap();
        let mut events = h.controller.subscribe();

        h.controller.logout().unwrap();

        assert_eq!(next_event(&mut events).await, SessionEvent::LoggedOut);
        assert_eq!(next_event(&mut events).await, SessionEvent::Redirect);
        assert_eq!(h.controller.scheduler_state(), SchedulerState::Idle);
        assert_eq!(h.controller.current_remaining_seconds(), 0);
        assert_eq!(h.controller.user().unwrap(), None);
        for key in CredentialKey::ALL {
            assert_eq!(h.store.get(key).unwrap(), None);
        }

        let calls = h.backend.calls().len();
        sleep(Duration::from_secs(600)).await;
        assert_eq!(h.backend.calls().len(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_refresh_keeps_store_empty() {
        let h = harness();
        h.controller.login(&credentials()).await.unwrap();
        h.backend.set_refresh_delay(Duration::from_secs(5));

        let scheduler = h.controller.scheduler();
        let (outcome, _) = tokio::join!(scheduler.refresh(RefreshKind::Quick), async {
            sleep(Duration::from_secs(1)).await;
            h.controller.logout().unwrap();
        });

        assert!(outcome.is_err());
        assert_eq!(h.store.get(CredentialKey::AccessToken).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_after_termination_restarts_monitoring() {
        let h = harness();
        h.controller.login(&credentials()).await.unwrap();
        let mut events = h.controller.subscribe();

        h.backend.push_verify_remaining(0);
        h.backend
            .fail_refresh(SessionError::InvalidRefreshToken("revoked".into()));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Expired { .. }
        ));
        assert!(!h.controller.resume().unwrap());

        h.backend.succeed_refresh();
        h.controller.login(&credentials()).await.unwrap();
        assert_eq!(h.controller.scheduler_state(), SchedulerState::Monitoring);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::LoggedIn { .. }
        ));

        // the pending redirect from the old session was cancelled
        sleep(Duration::from_secs(10)).await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_login_leaves_no_session() {
        let h = harness();
        h.backend
            .fail_login(SessionError::Unauthorized("Invalid username or password".into()));

        let err = h.controller.login(&credentials()).await.unwrap_err();

        assert_eq!(
            err,
            SessionError::Unauthorized("Invalid username or password".into())
        );
        assert_eq!(h.controller.scheduler_state(), SchedulerState::Idle);
        assert_eq!(h.store.get(CredentialKey::AccessToken).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_before_queued_termination_keeps_new_session() {
        let h = harness();
        h.controller.login(&credentials()).await.unwrap();
        let mut events = h.controller.subscribe();

        // terminate without yielding, so the supervisor has not run yet
        h.backend.push_verify_remaining(0);
        h.backend
            .fail_refresh(SessionError::InvalidRefreshToken("revoked".into()));
        h.controller.scheduler().health_check().await;
        assert_eq!(h.controller.scheduler_state(), SchedulerState::Terminated);

        h.backend.succeed_refresh();
        h.controller.login(&credentials()).await.unwrap();
        let fresh = h.store.get(CredentialKey::AccessToken).unwrap();
        assert!(fresh.is_some());

        // now let the supervisor drain the stale event
        sleep(Duration::from_secs(5)).await;

        assert_eq!(h.store.get(CredentialKey::AccessToken).unwrap(), fresh);
        assert_eq!(
            h.store.get(CredentialKey::RefreshToken).unwrap().as_deref(),
            Some("refresh-1")
        );
        assert_eq!(h.controller.scheduler_state(), SchedulerState::Monitoring);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::LoggedIn { .. })
        ));
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
