use branchgate::app::AppId;
use branchgate::backend::SharedBackend;
use branchgate::config::Config;
use branchgate::docker::DockerBackend;
use branchgate::github::GithubClient;
use branchgate::proxy::ProxyClient;
use branchgate::reaper::{IsReserved, Reaper};
use branchgate::registry::Registry;
use branchgate::reserved::ReservationSet;
use branchgate::server::{RouterServer, RouterState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("branchgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("branchgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        path = %config_path.display(),
        repositories = config.repository.len(),
        idle_shutdown_secs = config.general.idle_shutdown.as_secs(),
        "Configuration loaded"
    );

    // Connect to the container runtime; an unreachable daemon is fatal.
    let backend: SharedBackend = Arc::new(DockerBackend::new(config.clone()).await.map_err(|e| {
        error!(error = %e, "Failed to initialize Docker backend");
        e
    })?);

    let github = Arc::new(GithubClient::new(
        &config.github.token,
        &config.github.secret,
    ));

    // Reconcile the registry with containers that survived a restart, so
    // the first reaper tick applies the idle budget to them too.
    let registry = Arc::new(Registry::new());
    let running = backend.list().await.map_err(|e| {
        error!(error = %e, "Startup reconciliation failed");
        e
    })?;
    for app in &running {
        registry.touch(app);
    }
    info!(count = running.len(), "Reconciled running containers");

    // Seed reservations with the always-on branch heads. Open pull
    // requests re-enter through their webhook events.
    let reservations = Arc::new(ReservationSet::new(Arc::clone(&backend)));
    reservations.reconcile(&config, &github).await;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn the reaper with a read-only view of the reservation set.
    let is_reserved: IsReserved = {
        let reservations = Arc::clone(&reservations);
        Arc::new(move |app: &AppId| reservations.contains(app))
    };
    let reaper = Reaper::new(
        Arc::clone(&registry),
        Arc::clone(&backend),
        is_reserved,
        config.general.idle_shutdown,
    );
    tokio::spawn(reaper.run(shutdown_rx.clone()));

    // Start the router server.
    let bind_addr = config.listen_addr()?;
    let state = Arc::new(RouterState {
        config,
        backend,
        registry,
        reservations,
        github,
        proxy: ProxyClient::new(),
    });

    let server = RouterServer::new(bind_addr, state, shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Router server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and give the server a moment to drain.
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}
