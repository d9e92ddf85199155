//! Navigation signals toward the host's login screen

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Host-side routing, as seen by the session layer
pub trait Navigator: Send + Sync {
    fn current_path(&self) -> String;

    fn navigate(&self, path: &str);
}

/// Navigator that publishes the current route on a watch channel.
///
/// The host subscribes and renders whatever route is published.
#[derive(Clone)]
pub struct WatchNavigator {
    route: Arc<watch::Sender<String>>,
}

impl WatchNavigator {
    pub fn new(initial_path: impl Into<String>) -> Self {
        let (route, _) = watch::channel(initial_path.into());
        Self {
            route: Arc::new(route),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.route.subscribe()
    }
}

impl Navigator for WatchNavigator {
    fn current_path(&self) -> String {
        self.route.borrow().clone()
    }

    fn navigate(&self, path: &str) {
        self.route.send_replace(path.to_string());
    }
}

/// Sends the user to the login route, at most once while already there
#[derive(Clone)]
pub struct LoginRedirect {
    navigator: Arc<dyn Navigator>,
    login_route: String,
}

impl LoginRedirect {
    pub fn new(navigator: Arc<dyn Navigator>, login_route: impl Into<String>) -> Self {
        Self {
            navigator,
            login_route: login_route.into(),
        }
    }

    pub fn login_route(&self) -> &str {
        &self.login_route
    }

    pub fn is_on_login(&self) -> bool {
        self.navigator.current_path() == self.login_route
    }

    /// Returns whether a navigation was issued
    pub fn redirect_to_login(&self) -> bool {
        if self.is_on_login() {
            debug!("Already on {}, skipping login redirect", self.login_route);
            return false;
        }

        info!("Redirecting to {}", self.login_route);
        self.navigator.navigate(&self.login_route);
        true
    }
}
