//! Single-flight access token refresh

use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use super::redirect::LoginRedirect;
use super::session::AuthStatus;
use super::storage::TokenStore;
use crate::api::transport::{ApiRequest, HttpTransport, TransportError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    #[error("No refresh token stored")]
    MissingRefreshToken,

    /// The refresh token itself was refused; the session has been cleared
    #[error("Refresh token rejected with HTTP {status}")]
    Rejected { status: u16 },

    #[error("Refresh endpoint returned HTTP {status}")]
    Server { status: u16 },

    #[error("Refresh request failed: {0}")]
    Network(#[from] TransportError),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Token storage failed during refresh: {0}")]
    Storage(String),

    #[error("Refresh was abandoned before completing")]
    Abandoned,
}

impl RefreshError {
    /// Whether the session was torn down by this failure
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefreshError::Rejected { .. })
    }
}

pub type RefreshOutcome = Result<String, RefreshError>;

/// Token refresh response body
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    InFlight,
}

/// Coordination state for one refresh at a time.
///
/// The first caller to join an idle cycle becomes the leader and performs the network
/// call; later callers queue up and are settled with the leader's outcome in the order
/// they joined.
#[derive(Debug)]
pub struct RefreshCycle {
    state: CycleState,
    pending: VecDeque<oneshot::Sender<RefreshOutcome>>,
}

enum Ticket {
    Leader,
    Follower(oneshot::Receiver<RefreshOutcome>),
}

impl RefreshCycle {
    pub fn new() -> Self {
        Self {
            state: CycleState::Idle,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn join(&mut self) -> Ticket {
        match self.state {
            CycleState::Idle => {
                self.state = CycleState::InFlight;
                Ticket::Leader
            }
            CycleState::InFlight => {
                let (tx, rx) = oneshot::channel();
                self.pending.push_back(tx);
                Ticket::Follower(rx)
            }
        }
    }

    fn settle(&mut self, outcome: &RefreshOutcome) -> usize {
        self.state = CycleState::Idle;
        let waiters = self.pending.len();
        while let Some(waiter) = self.pending.pop_front() {
            let _ = waiter.send(outcome.clone());
        }
        waiters
    }
}

impl Default for RefreshCycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Settles the cycle with `Abandoned` if the leader's future is dropped mid-refresh
struct LeaderGuard<'a> {
    cycle: &'a Mutex<RefreshCycle>,
    settled: bool,
}

impl LeaderGuard<'_> {
    fn settle(mut self, outcome: &RefreshOutcome) {
        let waiters = lock(self.cycle).settle(outcome);
        if waiters > 0 {
            debug!("Released {} queued refresh waiters", waiters);
        }
        self.settled = true;
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Token refresh dropped before completion");
            lock(self.cycle).settle(&Err(RefreshError::Abandoned));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exchanges the refresh token for a new access token, one network call at a time
pub struct RefreshCoordinator {
    transport: Arc<dyn HttpTransport>,
    store: TokenStore,
    redirect: LoginRedirect,
    refresh_path: String,
    cycle: Mutex<RefreshCycle>,
    status: watch::Sender<AuthStatus>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: TokenStore,
        redirect: LoginRedirect,
        refresh_path: impl Into<String>,
    ) -> Self {
        Self::with_cycle(transport, store, redirect, refresh_path, RefreshCycle::new())
    }

    pub fn with_cycle(
        transport: Arc<dyn HttpTransport>,
        store: TokenStore,
        redirect: LoginRedirect,
        refresh_path: impl Into<String>,
        cycle: RefreshCycle,
    ) -> Self {
        Self {
            transport,
            store,
            redirect,
            refresh_path: refresh_path.into(),
            cycle: Mutex::new(cycle),
            status: watch::channel(AuthStatus::Checking).0,
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn redirect(&self) -> &LoginRedirect {
        &self.redirect
    }

    /// Current authentication status, shared with every holder of this coordinator
    pub fn status(&self) -> AuthStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.status.subscribe()
    }

    pub(crate) fn publish(&self, status: AuthStatus) -> AuthStatus {
        self.status.send_replace(status);
        status
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.cycle).state() == CycleState::InFlight
    }

    /// New access token, or `None` when no refresh token is stored or the refresh failed
    pub async fn refresh(&self) -> Option<String> {
        match self.try_refresh().await {
            Ok(token) => Some(token),
            Err(RefreshError::MissingRefreshToken) => None,
            Err(e) => {
                debug!("Token refresh failed: {}", e);
                None
            }
        }
    }

    /// Refresh, joining the in-flight cycle if one is already running
    pub async fn try_refresh(&self) -> RefreshOutcome {
        let ticket = lock(&self.cycle).join();

        match ticket {
            Ticket::Follower(rx) => {
                debug!("Refresh already in flight, waiting for its outcome");
                rx.await.unwrap_or(Err(RefreshError::Abandoned))
            }
            Ticket::Leader => {
                let guard = LeaderGuard {
                    cycle: &self.cycle,
                    settled: false,
                };
                let outcome = self.exchange().await;
                guard.settle(&outcome);
                outcome
            }
        }
    }

    async fn exchange(&self) -> RefreshOutcome {
        let refresh_token = self
            .store
            .refresh_token()
            .map_err(|e| RefreshError::Storage(e.to_string()))?
            .ok_or(RefreshError::MissingRefreshToken)?;

        let request = ApiRequest::post(self.refresh_path.as_str()).json(json!({ "refresh": refresh_token }));

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Token refresh did not get a response: {}", e);
                return Err(e.into());
            }
        };

        match response.status {
            200..=299 => {
                let tokens: RefreshResponse = serde_json::from_value(response.body)
                    .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

                let rotated = self
                    .store
                    .rotate_tokens(&tokens.access, tokens.refresh.as_deref())
                    .map_err(|e| {
                        error!("Failed to store refreshed tokens: {}", e);
                        RefreshError::Storage(e.to_string())
                    })?;

                if !rotated {
                    info!("Session ended while refreshing, discarding new tokens");
                    return Err(RefreshError::MissingRefreshToken);
                }

                info!(
                    "Access token refreshed{}",
                    if tokens.refresh.is_some() { " (refresh token rotated)" } else { "" }
                );
                Ok(tokens.access)
            }
            status @ (401 | 403) => {
                warn!("Refresh token rejected with HTTP {}, ending session", status);
                self.end_session();
                Err(RefreshError::Rejected { status })
            }
            status => {
                warn!("Token refresh failed with HTTP {}, keeping session", status);
                Err(RefreshError::Server { status })
            }
        }
    }

    /// Clear the stored session, publish `Unauthenticated` and send the user to login
    pub fn end_session(&self) {
        if let Err(e) = self.store.clear() {
            error!("Failed to clear session: {}", e);
        }
        self.publish(AuthStatus::Unauthenticated);
        self.redirect.redirect_to_login();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::ApiResponse;
    use crate::auth::redirect::WatchNavigator;
    use crate::auth::role::Role;
    use crate::auth::storage::SessionData;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    /// Refresh endpoint that holds every response until released
    struct GatedRefresh {
        calls: AtomicUsize,
        gate: Notify,
        reply: Result<ApiResponse, TransportError>,
    }

    impl GatedRefresh {
        fn new(reply: Result<ApiResponse, TransportError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                reply,
            })
        }
    }

    #[async_trait]
    impl HttpTransport for GatedRefresh {
        async fn send(&self, _request: ApiRequest) -> Result<ApiResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            self.reply.clone()
        }
    }

    fn logged_in_store() -> TokenStore {
        let store = TokenStore::in_memory();
        store
            .set_session_data(&SessionData {
                access_token: "old-access".to_string(),
                role: Role::Manager,
                profile: None,
                refresh_token: Some("refresh-1".to_string()),
            })
            .unwrap();
        store
    }

    fn coordinator(transport: Arc<dyn HttpTransport>, store: TokenStore) -> (RefreshCoordinator, WatchNavigator) {
        let navigator = WatchNavigator::new("/farmers");
        let redirect = LoginRedirect::new(Arc::new(navigator.clone()), "/login");
        (
            RefreshCoordinator::new(transport, store, redirect, "token/refresh/"),
            navigator,
        )
    }

    #[test]
    fn test_cycle_queues_followers_in_order() {
        let mut cycle = RefreshCycle::new();
        assert!(matches!(cycle.join(), Ticket::Leader));

        let mut receivers = Vec::new();
        for _ in 0..3 {
            match cycle.join() {
                Ticket::Follower(rx) => receivers.push(rx),
                Ticket::Leader => panic!("second leader while in flight"),
            }
        }
        assert_eq!(cycle.pending(), 3);

        assert_eq!(cycle.settle(&Ok("fresh".to_string())), 3);
        assert_eq!(cycle.state(), CycleState::Idle);
        for mut rx in receivers {
            assert_eq!(rx.try_recv().unwrap(), Ok("fresh".to_string()));
        }
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_call() {
        let transport = GatedRefresh::new(Ok(ApiResponse::new(
            200,
            json!({"access": "new-access", "refresh": "refresh-2"}),
        )));
        let (coordinator, _) = coordinator(transport.clone(), logged_in_store());

        let callers = futures::future::join_all((0..5).map(|_| coordinator.try_refresh()));
        let release = async {
            while transport.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            tokio::task::yield_now().await;
            transport.gate.notify_waiters();
        };

        let (outcomes, _) = tokio::join!(callers, release);

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(outcomes.iter().all(|o| o == &Ok("new-access".to_string())));
        assert_eq!(coordinator.store().access_token().unwrap().as_deref(), Some("new-access"));
        assert_eq!(coordinator.store().refresh_token().unwrap().as_deref(), Some("refresh-2"));
        assert_eq!(coordinator.store().role().unwrap(), Some(Role::Manager));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_follower_waits_for_leader() {
        let transport = GatedRefresh::new(Ok(ApiResponse::new(200, json!({"access": "new-access"}))));
        let (coordinator, _) = coordinator(transport.clone(), logged_in_store());

        let mut leader = task::spawn(coordinator.try_refresh());
        assert_pending!(leader.poll());
        let mut follower = task::spawn(coordinator.try_refresh());
        assert_pending!(follower.poll());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        transport.gate.notify_waiters();
        assert_ready_eq!(leader.poll(), Ok("new-access".to_string()));
        assert!(follower.is_woken());
        assert_ready_eq!(follower.poll(), Ok("new-access".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_failure() {
        let transport = GatedRefresh::new(Ok(ApiResponse::new(503, json!({}))));
        let (coordinator, _) = coordinator(transport.clone(), logged_in_store());

        let callers = futures::future::join_all((0..3).map(|_| coordinator.try_refresh()));
        let release = async {
            while transport.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            tokio::task::yield_now().await;
            transport.gate.notify_waiters();
        };

        let (outcomes, _) = tokio::join!(callers, release);

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(outcomes.iter().all(|o| o == &Err(RefreshError::Server { status: 503 })));
        assert_eq!(coordinator.store().access_token().unwrap().as_deref(), Some("old-access"));
    }

    #[tokio::test]
    async fn test_refresh_timeout_keeps_session() {
        let timeout = TransportError::Timeout(std::time::Duration::from_secs(30));
        let transport = GatedRefresh::new(Err(timeout.clone()));
        let (coordinator, navigator) = coordinator(transport.clone(), logged_in_store());
        coordinator.publish(AuthStatus::Authenticated(Role::Manager));
        let route = navigator.subscribe();

        let leader = coordinator.try_refresh();
        let release = async {
            while transport.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            transport.gate.notify_waiters();
        };
        let (outcome, _) = tokio::join!(leader, release);

        assert_eq!(outcome, Err(RefreshError::Network(timeout)));
        assert!(!outcome.unwrap_err().is_terminal());
        assert_eq!(coordinator.store().access_token().unwrap().as_deref(), Some("old-access"));
        assert_eq!(coordinator.store().refresh_token().unwrap().as_deref(), Some("refresh-1"));
        assert_eq!(coordinator.store().role().unwrap(), Some(Role::Manager));
        assert_eq!(coordinator.status(), AuthStatus::Authenticated(Role::Manager));
        assert!(!route.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_missing_refresh_token_skips_network() {
        let transport = GatedRefresh::new(Ok(ApiResponse::new(200, json!({"access": "x"}))));
        let (coordinator, _) = coordinator(transport.clone(), TokenStore::in_memory());

        assert_eq!(coordinator.refresh().await, None);
        assert_eq!(coordinator.try_refresh().await, Err(RefreshError::MissingRefreshToken));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_followers() {
        let transport = GatedRefresh::new(Ok(ApiResponse::new(200, json!({"access": "x"}))));
        let (coordinator, _) = coordinator(transport.clone(), logged_in_store());

        let outcome = {
            let mut leader = Box::pin(coordinator.try_refresh());
            // Drive the leader into the network call, then abandon it
            tokio::select! {
                biased;
                _ = &mut leader => panic!("gate is closed"),
                _ = tokio::task::yield_now() => {}
            }
            assert!(coordinator.is_refreshing());
            let mut follower = Box::pin(coordinator.try_refresh());
            tokio::select! {
                biased;
                _ = &mut follower => panic!("follower settled early"),
                _ = tokio::task::yield_now() => {}
            }
            drop(leader);
            follower.await
        };

        assert_eq!(outcome, Err(RefreshError::Abandoned));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_terminal_rejection_clears_and_redirects_once() {
        let transport = GatedRefresh::new(Ok(ApiResponse::new(
            401,
            json!({"detail": "Token is invalid or expired", "code": "token_not_valid"}),
        )));
        let (coordinator, navigator) = coordinator(transport.clone(), logged_in_store());
        coordinator.publish(AuthStatus::Authenticated(Role::Manager));
        let mut route = navigator.subscribe();
        let mut status = coordinator.subscribe();

        let leader = coordinator.try_refresh();
        let release = async {
            while transport.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            transport.gate.notify_waiters();
        };
        let (outcome, _) = tokio::join!(leader, release);

        assert_eq!(outcome, Err(RefreshError::Rejected { status: 401 }));
        assert!(outcome.unwrap_err().is_terminal());
        assert!(coordinator.store().session().unwrap().is_none());
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), AuthStatus::Unauthenticated);
        assert!(route.has_changed().unwrap());
        assert_eq!(*route.borrow_and_update(), "/login");

        // Session is gone, so a second attempt never reaches the network or the router
        assert_eq!(coordinator.refresh().await, None);
        assert!(!route.has_changed().unwrap());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
