//! Session establishment: startup validation, login and logout

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::refresh::{RefreshCoordinator, RefreshError};
use super::role::{normalize_role, Role, RoleError};
use super::storage::{Session, SessionData, StoreError, TokenStore, UserProfile};
use crate::api::{ApiClient, ApiError, ApiRequest, HttpTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Checking,
    Authenticated(Role),
    Unauthenticated,
}

impl AuthStatus {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthStatus::Authenticated(_))
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Invalid login response: {0}")]
    InvalidResponse(String),

    #[error("Session ended while it was being validated")]
    Ended,

    #[error("Role error: {0}")]
    Role(#[from] RoleError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Login response from the token endpoint
#[derive(Debug, Deserialize)]
struct LoginResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
    #[serde(default)]
    user: Option<Value>,
}

/// Establishes and tears down the session.
///
/// The authentication status lives on the refresh coordinator, so a session ended by a
/// rejected refresh shows up here as well.
pub struct SessionManager {
    client: ApiClient,
    transport: Arc<dyn HttpTransport>,
    login_path: String,
    current_user_path: String,
}

impl SessionManager {
    pub fn new(
        client: ApiClient,
        transport: Arc<dyn HttpTransport>,
        login_path: impl Into<String>,
        current_user_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            transport,
            login_path: login_path.into(),
            current_user_path: current_user_path.into(),
        }
    }

    pub fn store(&self) -> &TokenStore {
        self.client.coordinator().store()
    }

    fn coordinator(&self) -> &RefreshCoordinator {
        self.client.coordinator()
    }

    pub fn status(&self) -> AuthStatus {
        self.coordinator().status()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.coordinator().subscribe()
    }

    fn publish(&self, status: AuthStatus) -> AuthStatus {
        self.coordinator().publish(status)
    }

    /// Check a stored session against the backend.
    ///
    /// Network failures keep the cached session; 401/403, unreadable roles and any other
    /// failure clear it.
    pub async fn validate(&self) -> AuthStatus {
        self.publish(AuthStatus::Checking);

        let cached = match self.store().session() {
            Ok(Some(session)) => session,
            Ok(None) => {
                if matches!(self.store().access_token(), Ok(Some(_))) {
                    warn!("Stored token has no role, discarding it");
                    self.clear_store();
                }
                debug!("No stored session");
                return self.publish(AuthStatus::Unauthenticated);
            }
            Err(e) => {
                warn!("Stored session is unreadable: {}", e);
                self.clear_store();
                return self.publish(AuthStatus::Unauthenticated);
            }
        };

        let status = match self.client.send(ApiRequest::get(self.current_user_path.as_str())).await {
            Ok(response) => match self.resync(&response.body) {
                Ok(role) => {
                    info!("Session validated as {}", role);
                    AuthStatus::Authenticated(role)
                }
                Err(e) => {
                    warn!("Could not establish role for stored session: {}", e);
                    self.clear_store();
                    AuthStatus::Unauthenticated
                }
            },
            Err(e) if is_offline(&e) => {
                info!("Backend unreachable, keeping cached session: {}", e);
                AuthStatus::Authenticated(cached.role)
            }
            Err(e) => {
                match e.status() {
                    Some(401) | Some(403) => info!("Stored session rejected by backend"),
                    _ => warn!("Session validation failed: {}", e),
                }
                self.clear_store();
                AuthStatus::Unauthenticated
            }
        };

        self.publish(status)
    }

    fn resync(&self, user: &Value) -> Result<Role, SessionError> {
        let role = normalize_role(user)?;
        let profile = profile_from(user);

        if !self.store().update_identity(role, profile.as_ref())? {
            return Err(SessionError::Ended);
        }
        Ok(role)
    }

    /// Exchange credentials for tokens and store the resulting session
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, SessionError> {
        info!("Logging in as {}", username);

        let request = ApiRequest::post(self.login_path.as_str())
            .json(json!({ "username": username, "password": password }));
        let response = self.transport.send(request).await.map_err(ApiError::from)?;

        match response.status {
            200..=299 => {}
            400 | 401 => {
                warn!("Login rejected for {}", username);
                return Err(SessionError::InvalidCredentials);
            }
            status => {
                return Err(ApiError::Http {
                    status,
                    body: response.body,
                }
                .into())
            }
        }

        let tokens: LoginResponse = serde_json::from_value(response.body)
            .map_err(|e| SessionError::InvalidResponse(e.to_string()))?;

        let user = match tokens.user {
            Some(user) => user,
            None => self.fetch_current_user(&tokens.access).await?,
        };

        let role = normalize_role(&user)?;
        let data = SessionData {
            access_token: tokens.access,
            role,
            profile: profile_from(&user),
            refresh_token: tokens.refresh,
        };
        self.store().set_session_data(&data)?;

        info!("Logged in as {} with role {}", username, role);
        self.publish(AuthStatus::Authenticated(role));

        Ok(Session {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            role: data.role,
            profile: data.profile,
        })
    }

    async fn fetch_current_user(&self, access_token: &str) -> Result<Value, SessionError> {
        let request = ApiRequest::get(self.current_user_path.as_str()).with_bearer(access_token);
        let response = self.transport.send(request).await.map_err(ApiError::from)?;

        if !response.is_success() {
            return Err(ApiError::Http {
                status: response.status,
                body: response.body,
            }
            .into());
        }

        Ok(response.body)
    }

    /// Forget the session and send the user to login
    pub fn logout(&self) {
        info!("Logging out");
        self.coordinator().end_session();
    }

    fn clear_store(&self) {
        if let Err(e) = self.store().clear() {
            error!("Failed to clear session: {}", e);
        }
    }
}

fn is_offline(err: &ApiError) -> bool {
    matches!(
        err,
        ApiError::Transport(_) | ApiError::Refresh(RefreshError::Network(_))
    )
}

fn profile_from(user: &Value) -> Option<UserProfile> {
    match serde_json::from_value::<UserProfile>(user.clone()) {
        Ok(mut profile) => {
            profile.extra.remove("role");
            profile.extra.remove("role_id");
            Some(profile)
        }
        Err(e) => {
            debug!("User payload is not a profile: {}", e);
            None
        }
    }
}
