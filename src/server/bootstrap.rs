use crate::config::RouterConfig;
use crate::config_persist::ConfigPersister;
use crate::metrics::Metrics;
use crate::router::Router;
use crate::server::{self, AdminState};
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub admin_listen: String,
    /// `--no-ui`: the terminal dashboard is out of scope for this build: the
    /// flag is accepted (so existing invocations keep working) but there is
    /// nothing for it to suppress.
    pub no_ui: bool,
}

/// Router lifecycle: init → load config → build router → serve admin HTTP →
/// block for shutdown → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    if !args.no_ui {
        tracing::debug!("server: --no-ui not set; no terminal dashboard ships with this build regardless");
    }

    let config = RouterConfig::load(&args.config_path)?;
    let metrics = Metrics::install();
    let router = Router::new(config).await;

    let shutdown = std::sync::Arc::new(Notify::new());

    let status_handle = router.spawn_status_monitor();

    let persister = ConfigPersister::new(args.config_path.clone(), Duration::from_secs(5));
    let persist_handle = persister.spawn(router.shared_config(), router.shared_dirty_flag());

    let admin_state = AdminState {
        router: router.clone(),
        metrics,
    };
    let admin_addr = args.admin_listen.clone();
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, admin_state).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });

    tracing::info!(admin_listen = %args.admin_listen, "server: router started");

    wait_for_shutdown(&shutdown).await;

    tracing::info!("server: shutting down");
    router.shutdown();
    status_handle.abort();
    persist_handle.abort();
    admin_handle.abort();

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_shutdown(shutdown: &std::sync::Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
