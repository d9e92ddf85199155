use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::auth::{token, RefreshCoordinator, RefreshError};
use crate::config::SessionConfig;

/// Host events that may follow a long pause (sleep, background tab)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Visibility { visible: bool },
    FocusGained,
}

/// What a proactive check did
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshCheck {
    /// Nothing to refresh with
    NoSession,
    /// Access token is outside the refresh buffer
    Fresh,
    Refreshed,
    Failed(RefreshError),
}

/// Refresh ahead of expiry when the stored access token is missing or about to lapse
pub async fn check_and_refresh(coordinator: &RefreshCoordinator, buffer: Duration) -> RefreshCheck {
    let store = coordinator.store();

    let (access, refresh) = match (store.access_token(), store.refresh_token()) {
        (Ok(access), Ok(refresh)) => (access, refresh),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to read session for refresh check: {}", e);
            return RefreshCheck::Failed(RefreshError::Storage(e.to_string()));
        }
    };

    match (&access, &refresh) {
        (None, None) => return RefreshCheck::NoSession,
        (None, Some(_)) => debug!("No access token but a refresh token is stored, refreshing"),
        (Some(access), _) => {
            if !token::is_expired_or_expiring_soon(Some(access.as_str()), buffer) {
                return RefreshCheck::Fresh;
            }
            debug!(
                "Access token expires within {}s, refreshing",
                buffer.as_secs()
            );
        }
    }

    match coordinator.try_refresh().await {
        Ok(_) => RefreshCheck::Refreshed,
        Err(RefreshError::MissingRefreshToken) => RefreshCheck::NoSession,
        Err(e) => {
            warn!("Proactive refresh failed: {}", e);
            RefreshCheck::Failed(e)
        }
    }
}

/// Drives proactive refreshes from a timer and from host lifecycle events
pub struct SessionScheduler {
    coordinator: Arc<RefreshCoordinator>,
    interval: Duration,
    buffer: Duration,
}

impl SessionScheduler {
    pub fn new(coordinator: Arc<RefreshCoordinator>, config: &SessionConfig) -> Self {
        Self::with_timing(coordinator, config.check_interval(), config.refresh_buffer())
    }

    pub fn with_timing(coordinator: Arc<RefreshCoordinator>, interval: Duration, buffer: Duration) -> Self {
        Self {
            coordinator,
            interval,
            buffer,
        }
    }

    /// Spawn the scheduler loop on the current tokio runtime
    pub fn start(self) -> SchedulerHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(
            "Starting session scheduler: every {}s, {}s refresh buffer",
            self.interval.as_secs(),
            self.buffer.as_secs()
        );

        let task = tokio::spawn(self.run(events_rx));

        SchedulerHandle {
            notifier: LifecycleNotifier { events: events_tx },
            task,
        }
    }

    async fn run(self, mut events: mpsc::UnboundedReceiver<LifecycleEvent>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Checks run as their own tasks so a slow refresh never holds back the next tick.
        // Dropping the set when this loop is aborted cancels them too.
        let mut checks = JoinSet::new();

        loop {
            let trigger = tokio::select! {
                _ = ticker.tick() => "interval",
                event = events.recv() => match event {
                    Some(LifecycleEvent::Visibility { visible: true }) => "visibility",
                    Some(LifecycleEvent::FocusGained) => "focus",
                    Some(LifecycleEvent::Visibility { visible: false }) => continue,
                    None => break,
                },
                Some(_) = checks.join_next(), if !checks.is_empty() => continue,
            };

            debug!("Session check triggered by {}", trigger);
            let coordinator = self.coordinator.clone();
            let buffer = self.buffer;
            checks.spawn(async move {
                let outcome = check_and_refresh(&coordinator, buffer).await;
                debug!("Session check finished: {:?}", outcome);
                outcome
            });
        }

        info!("Session scheduler stopped");
    }
}

/// Cloneable sender the host wires to its visibility and focus listeners
#[derive(Clone)]
pub struct LifecycleNotifier {
    events: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleNotifier {
    /// Returns `false` once the scheduler has stopped
    pub fn notify(&self, event: LifecycleEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Running scheduler. Stopping or dropping it cancels the timer and pending checks.
pub struct SchedulerHandle {
    notifier: LifecycleNotifier,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn notify(&self, event: LifecycleEvent) -> bool {
        self.notifier.notify(event)
    }

    pub fn notifier(&self) -> LifecycleNotifier {
        self.notifier.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
