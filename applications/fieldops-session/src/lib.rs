pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;

// Re-export commonly used items
pub use api::{ApiClient, ApiError, ApiRequest, HttpTransport, ReqwestTransport};
pub use auth::{AuthStatus, RefreshCoordinator, Role, SessionManager, TokenStore, WatchNavigator};
pub use config::Config;
pub use context::SessionContext;
pub use error::{AppError, Result};
pub use lifecycle::{LifecycleEvent, SchedulerHandle, SessionScheduler};
