pub mod scheduler;

pub use scheduler::{
    check_and_refresh, LifecycleEvent, LifecycleNotifier, RefreshCheck, SchedulerHandle, SessionScheduler,
};
