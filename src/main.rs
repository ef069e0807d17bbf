use rendergate::access_log::LogQueue;
use rendergate::admin::{AdminContext, AdminServer, PKG_NAME, VERSION};
use rendergate::browser::{LazyChromiumRenderer, Renderer};
use rendergate::cache::RenderCacheEngine;
use rendergate::config::Config;
use rendergate::dispatch::ModeDispatcher;
use rendergate::engine::GatewayContext;
use rendergate::geoip::GeoIpResolver;
use rendergate::metrics::Metrics;
use rendergate::preheat::PreheatRunner;
use rendergate::push::PushRunner;
use rendergate::registry::EngineManager;
use rendergate::scheduler::Scheduler;
use rendergate::session::{SessionConfig, SessionManager};
use rendergate::store::{RedisStore, Store};
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
                .add_directive("rendergate=debug".parse().expect("valid log directive")),
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
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Connect the key-value store; everything shares it
    let store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(&config.server.redis_url)
            .await
            .map_err(|e| {
                error!(url = %config.server.redis_url, error = %e, "Failed to connect to store");
                anyhow::anyhow!("store connection failed: {}", e)
            })?,
    );
    info!(url = %config.server.redis_url, "Store connected");

    let geoip = Arc::new(GeoIpResolver::new(
        config.server.geoip_db.as_deref(),
        &config.server.server_country,
    ));

    let metrics = Metrics::new();
    let (log, log_writer_handle) = LogQueue::start(
        config.server.log_queue_capacity,
        Arc::clone(&store),
        Arc::clone(&metrics),
        shutdown_rx.clone(),
    );

    // The browser launches lazily on first render
    let renderer: Arc<dyn Renderer> = Arc::new(LazyChromiumRenderer::new(
        config.defaults.render_pool_size,
    ));

    let cache = Arc::new(RenderCacheEngine::new(
        Arc::clone(&store),
        renderer,
        Arc::clone(&metrics),
        log.clone(),
    ));
    let dispatcher = Arc::new(ModeDispatcher::new(
        Arc::clone(&metrics),
        log.clone(),
        config.server.sites_root.clone(),
    ));

    let ctx = GatewayContext {
        store: Arc::clone(&store),
        geoip,
        metrics: Arc::clone(&metrics),
        log,
        cache: Arc::clone(&cache),
        dispatcher,
        defaults: config.defaults.clone(),
        sites_root: config.server.sites_root.clone(),
        bind: config.server.bind.clone(),
    };

    // Start one engine per configured site
    let registry = EngineManager::new(ctx);
    registry.start_all(config.sites.clone()).await;

    // Background workers
    let preheat = PreheatRunner::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        config.defaults.clone(),
    );
    let push = PushRunner::new(Arc::clone(&store));

    let scheduler = Scheduler::new(
        Arc::clone(&registry),
        Arc::clone(&preheat),
        Arc::clone(&push),
    );
    let scheduler_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            scheduler.run(shutdown).await;
        })
    };

    // Sessions for the admin surface
    let session_config = match config.server.session_secret.clone() {
        Some(secret) => SessionConfig {
            secret,
            ..SessionConfig::default()
        },
        None => SessionConfig::default(),
    };
    let sessions = Arc::new(SessionManager::new(Arc::clone(&store), session_config));

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("invalid admin bind address: {}", e)
        })?;

    let admin_server = AdminServer::new(
        admin_addr,
        AdminContext {
            registry: Arc::clone(&registry),
            preheat,
            push,
            sessions,
            metrics,
            store,
        },
        shutdown_rx.clone(),
        admin_token,
    );

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

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
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    match Config::load(&config_path) {
                        Ok(new_config) => match registry.apply_config(&new_config).await {
                            Ok(result) => {
                                info!(
                                    added = result.added.len(),
                                    removed = result.removed.len(),
                                    updated = result.updated.len(),
                                    "Configuration reloaded successfully"
                                );
                                if !result.added.is_empty() {
                                    info!(sites = ?result.added, "New sites serving");
                                }
                                if !result.removed.is_empty() {
                                    info!(sites = ?result.removed, "Sites removed");
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "Failed to apply reloaded configuration");
                            }
                        },
                        Err(e) => {
                            error!(error = %e, "Failed to reload configuration");
                        }
                    }
                }
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

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop all site engines (each drains in-flight requests)
    info!("Stopping all site engines...");
    registry.stop_all().await;

    // Wait for background tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = scheduler_handle.await;
        let _ = admin_handle.await;
        let _ = log_writer_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Write PID
        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        redis = %config.server.redis_url,
        sites_root = %config.server.sites_root.display(),
        geoip = config.server.geoip_db.is_some(),
        "Server configuration"
    );
    info!(
        render_timeout_secs = config.defaults.render_timeout_secs,
        cache_ttl_secs = config.defaults.cache_ttl_secs,
        render_pool_size = config.defaults.render_pool_size,
        shutdown_grace_period_secs = config.defaults.shutdown_grace_period_secs,
        "Render defaults"
    );
    info!(
        site_count = config.sites.len(),
        sites = ?config.sites.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        "Configured sites"
    );
}
