use goule::admin::{AdminServer, PKG_NAME, VERSION};
use goule::config::Config;
use goule::registry::ServiceRegistry;
use goule::supervisor::SupervisorOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
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
                .add_directive("goule=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Build the registry stopped, then launch what is flagged
    let registry = Arc::new(ServiceRegistry::new(SupervisorOptions::from(&config.defaults)));
    registry.load(&config.services)?;
    registry.autolaunch_all().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
            .parse()
            .map_err(|e| {
                error!(
                    bind = %config.server.bind,
                    admin_port = config.server.admin_port,
                    error = %e,
                    "Invalid admin bind address"
                );
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(
                token = %token,
                "Generated admin API token (configure admin_token to set a fixed value)"
            );
            token
        });

        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&registry),
            shutdown_rx.clone(),
            admin_token,
        );
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        info!("Admin API disabled (admin_port = 0)");
        None
    };

    wait_for_shutdown(&registry, &config_path).await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all services...");
    registry.stop_all().await;
    registry.shutdown().await;

    if let Some(handle) = admin_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, reloading the configuration on SIGHUP
#[cfg(unix)]
async fn wait_for_shutdown(registry: &ServiceRegistry, config_path: &Path) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                reload_config(registry, config_path).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_registry: &ServiceRegistry, _config_path: &Path) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

#[cfg(unix)]
async fn reload_config(registry: &ServiceRegistry, config_path: &Path) {
    // Server and supervisor defaults only apply at startup.
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
            return;
        }
    };

    let result = registry.apply_config(&config.services).await;
    if !result.added.is_empty() {
        info!(services = ?result.added, "New services added");
    }
    if !result.removed.is_empty() {
        info!(services = ?result.removed, "Services removed");
    }
    if !result.updated.is_empty() {
        info!(services = ?result.updated, "Services updated");
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting supervisor");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        pid_file = ?config.server.pid_file,
        "Server configuration"
    );
    info!(
        shutdown_grace_period_ms = config.defaults.shutdown_grace_period_ms,
        kill_wait_ms = config.defaults.kill_wait_ms,
        backlog_capacity = config.defaults.backlog_capacity,
        "Supervisor defaults"
    );
    info!(
        service_count = config.services.len(),
        services = ?config.services.keys().collect::<Vec<_>>(),
        autolaunch = ?config
            .services
            .iter()
            .filter(|(_, s)| s.autolaunch)
            .map(|(name, _)| name)
            .collect::<Vec<_>>(),
        "Configured services"
    );
}
