use fieldops_session::{
    auth::{AuthStatus, SessionError},
    config::Config,
    SessionContext, WatchNavigator,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fieldops_session=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting fieldops-session agent");

    // Load configuration
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/config.yaml".to_string());

    let config = Config::load(&config_path)?;
    info!("Configuration loaded from: {}", config_path);

    let navigator = WatchNavigator::new("/");
    let mut routes = navigator.subscribe();
    tokio::spawn(async move {
        while routes.changed().await.is_ok() {
            let route = routes.borrow_and_update().clone();
            info!("Navigated to {}", route);
        }
    });

    let context = SessionContext::from_config(&config, Arc::new(navigator))?;

    let mut status = context.session.validate().await;
    if !status.is_authenticated() {
        status = match credentials() {
            Some((username, password)) => match context.session.login(&username, &password).await {
                Ok(session) => AuthStatus::Authenticated(session.role),
                Err(SessionError::InvalidCredentials) => {
                    error!("Login rejected for {}", username);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                warn!("No stored session; set FIELDOPS_USERNAME and FIELDOPS_PASSWORD to log in");
                return Ok(());
            }
        };
    }
    info!("Session ready: {:?}", status);

    let mut updates = context.session.subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let status = *updates.borrow_and_update();
            info!("Auth status changed: {:?}", status);
        }
    });

    let scheduler = context.start_scheduler();

    shutdown_signal().await;

    scheduler.stop();
    info!("Session agent shutdown complete");
    Ok(())
}

fn credentials() -> Option<(String, String)> {
    let username = std::env::var("FIELDOPS_USERNAME").ok()?;
    let password = std::env::var("FIELDOPS_PASSWORD").ok()?;
    Some((username, password))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
