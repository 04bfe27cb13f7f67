use routekeeper::admin::{AdminContext, AdminServer, PKG_NAME, VERSION};
use routekeeper::auth::{CapabilityCheck, RemoteGroupCheck, StaticTokenCheck};
use routekeeper::config::Config;
use routekeeper::registry::Registry;
use routekeeper::render::{render_main_config, write_atomic, ConfigWriter};
use routekeeper::state::StateStore;
use routekeeper::supervisor::{ProxyCommand, ProxySupervisor, Reloader};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routekeeper=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("routekeeper.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    if config.proxy.write_main_config {
        let contents = render_main_config(&config.paths.conf_dir, config.proxy.listen_port);
        write_atomic(&config.paths.main_config, contents.as_bytes()).map_err(|e| {
            error!(path = %config.paths.main_config.display(), error = %e, "Failed to write proxy main configuration");
            e
        })?;
        info!(path = %config.paths.main_config.display(), "Proxy main configuration written");
    }

    // The state file is the source of truth; refuse to start without it
    let store = StateStore::new(&config.paths.state_file);
    let model = store.load().map_err(|e| {
        error!(path = %config.paths.state_file.display(), error = %e, "Failed to load routing state");
        e
    })?;

    let supervisor = ProxySupervisor::new(
        ProxyCommand::parse(&config.proxy.start_command)?,
        ProxyCommand::parse(&config.proxy.reload_command)?,
        config.proxy.reload_timeout(),
        config.proxy.shutdown_grace_period(),
    );

    let writer = ConfigWriter::new(
        config.paths.conf_dir.clone(),
        config.paths.aggregate_name.clone(),
        config.proxy.listen_port,
    );
    let reloader: Arc<dyn Reloader> = supervisor.clone();
    let registry = Registry::new(model, writer, store, reloader);

    // Files must exist before the proxy reads its configuration
    registry.render_current().await?;

    supervisor.start().map_err(|e| {
        error!(error = %e, "Failed to start proxy");
        e
    })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let auth: Arc<dyn CapabilityCheck> = match &config.server.auth_url {
        Some(url) => {
            info!(auth_url = %url, "Using external authorization service");
            Arc::new(RemoteGroupCheck::new(url.clone(), config.server.auth_timeout())?)
        }
        None => {
            let token = config.server.admin_token.clone().unwrap_or_else(|| {
                let token = uuid::Uuid::new_v4().to_string();
                info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
                token
            });
            Arc::new(StaticTokenCheck::new(token))
        }
    };

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    let admin_server = AdminServer::new(
        admin_addr,
        AdminContext::new(Arc::clone(&registry), auth),
        shutdown_rx.clone(),
    );

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM), a resync request (SIGHUP)
    // or the proxy dying underneath us
    let mut proxy_exit: Option<String> = None;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup())
            .expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, rewriting proxy configuration...");
                    match registry.resync().await {
                        Ok(report) => {
                            info!(duration_ms = report.duration.as_millis() as u64, "Proxy configuration resynchronised");
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to resynchronise proxy configuration");
                        }
                    }
                }
                status = supervisor.wait_for_exit() => {
                    proxy_exit = Some(status);
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
            status = supervisor.wait_for_exit() => {
                proxy_exit = Some(status);
            }
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    if proxy_exit.is_none() {
        info!("Stopping proxy...");
        supervisor.stop().await;
    }

    // Wait for the admin server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = admin_handle.await;
    })
    .await;

    if registry.is_degraded() {
        warn!("Registry was read-only at shutdown; the state file may be behind the proxy configuration");
    }

    if let Some(status) = proxy_exit {
        error!(status = %status, "Proxy exited, shutting down");
        anyhow::bail!("proxy process exited: {}", status);
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!("========================================");
    info!("  {} v{}", PKG_NAME, VERSION);
    info!("========================================");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        "Admin API"
    );
    info!(
        state_file = %config.paths.state_file.display(),
        conf_dir = %config.paths.conf_dir.display(),
        aggregate = %config.paths.aggregate_name,
        "Paths"
    );
    info!(
        start = %config.proxy.start_command,
        reload = %config.proxy.reload_command,
        listen_port = config.proxy.listen_port,
        reload_timeout_secs = config.proxy.reload_timeout_secs,
        "Proxy"
    );
    if config.server.auth_url.is_some() {
        info!("Authorization: external group lookup");
    } else if config.server.admin_token.is_some() {
        info!("Authorization: static admin token");
    } else {
        warn!("Authorization: no token configured, one will be generated");
    }
    info!("========================================");
}
