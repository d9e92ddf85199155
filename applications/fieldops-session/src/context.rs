use std::sync::Arc;
use tracing::info;

use crate::api::{ApiClient, HttpTransport, ReqwestTransport};
use crate::auth::{FileStorage, LoginRedirect, Navigator, RefreshCoordinator, SessionManager, TokenStore};
use crate::config::{Config, SessionConfig};
use crate::error::Result;
use crate::lifecycle::{SchedulerHandle, SessionScheduler};

/// Everything a running client needs, wired around one token store and one refresh coordinator
pub struct SessionContext {
    pub store: TokenStore,
    pub coordinator: Arc<RefreshCoordinator>,
    pub client: ApiClient,
    pub session: SessionManager,
    session_config: SessionConfig,
}

impl SessionContext {
    /// Build the HTTP transport and token store described by `config`
    pub fn from_config(config: &Config, navigator: Arc<dyn Navigator>) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(
            config.api.base_url.clone(),
            config.request_timeout(),
        )?);

        let store = match config.storage_path()? {
            Some(path) => {
                info!("Persisting session to {}", path.display());
                TokenStore::new(Arc::new(FileStorage::open(&path)?))
            }
            None => TokenStore::in_memory(),
        };

        Ok(Self::with_transport(config, transport, store, navigator))
    }

    pub fn with_transport(
        config: &Config,
        transport: Arc<dyn HttpTransport>,
        store: TokenStore,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let redirect = LoginRedirect::new(navigator, config.auth.login_route.clone());
        let coordinator = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            redirect,
            config.auth.refresh_path.clone(),
        ));
        let client = ApiClient::new(transport.clone(), coordinator.clone());
        let session = SessionManager::new(
            client.clone(),
            transport,
            config.auth.login_path.clone(),
            config.auth.current_user_path.clone(),
        );

        Self {
            store,
            coordinator,
            client,
            session,
            session_config: config.session.clone(),
        }
    }

    pub fn scheduler(&self) -> SessionScheduler {
        SessionScheduler::new(self.coordinator.clone(), &self.session_config)
    }

    pub fn start_scheduler(&self) -> SchedulerHandle {
        self.scheduler().start()
    }
}
