//! Client-side authentication: token storage, JWT inspection, refresh and session state

pub mod redirect;
pub mod refresh;
pub mod role;
pub mod session;
pub mod storage;
pub mod token;

pub use redirect::{LoginRedirect, Navigator, WatchNavigator};
pub use refresh::{CycleState, RefreshCoordinator, RefreshCycle, RefreshError, RefreshOutcome};
pub use role::{normalize_role, Role, RoleError};
pub use session::{AuthStatus, SessionError, SessionManager};
pub use storage::{
    FileStorage, MemoryStorage, Session, SessionData, SessionKey, Storage, StoreError, TokenStore,
    UserProfile,
};
pub use token::{DecodedToken, TokenStatus, DEFAULT_REFRESH_BUFFER};
