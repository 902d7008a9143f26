//! adnode-daemon - campaign link attribution node
//!
//! One process per host. Startup takes the instance lock, opens the state
//! database, syncs campaign links, binds the fixed HTTPS port and the
//! operator socket, then runs until a signal, an operator `kill`, or a
//! committed self-update hands the port to a successor.
//!
//! # Started by a predecessor
//!
//! When the handover variables are present the listener and lock are
//! adopted instead of bound, and the process reports readiness and waits
//! for the predecessor's commit before it accepts anything. See
//! [`adnode_daemon::handover`].
//!
//! # Exit
//!
//! An ordinary shutdown drains in-flight requests, parks queued credits,
//! flushes state, removes the PID file and releases the lock. After a
//! handover the PID file and lock stay with the successor.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use adnode_core::attribution::AttributionEngine;
use adnode_core::clock::SystemClock;
use adnode_core::config::NodeConfig;
use adnode_core::forward::{ForwardPolicy, ForwardQueue, Forwarder};
use adnode_core::link::LinkRegistry;
use adnode_core::lock::NodeInstanceLock;
use adnode_core::operator::OperatorChannel;
use adnode_core::store::NodeStore;
use adnode_core::twofactor::TwoFactorBook;
use adnode_core::update::{UpdateSupervisor, UpdateTimings, Version};
use adnode_daemon::backend::{BackendSettings, HttpBackend};
use adnode_daemon::endpoint::{
    AppState, ConnectionLimits, EndpointControl, EndpointServing, RedirectPolicy, SecureEndpoint,
    bind_listener, load_acceptor, load_certificates, router,
};
use adnode_daemon::handover::{Decision, Inherited, ProcessLauncher};
use adnode_daemon::metrics::{DEFAULT_METRICS_PORT, SharedMetricsRegistry, new_shared_registry};
use adnode_daemon::operator::OperatorSocket;
use adnode_daemon::pidfile::{remove_pid_file, write_pid_file};
use adnode_daemon::state::{NodeParts, NodeState};
use adnode_daemon::tasks::{run_link_sync, run_reconcile, sync_links_once};
use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Attempts to bind the metrics port; a predecessor may still hold it
/// briefly after a handover.
const METRICS_BIND_ATTEMPTS: u32 = 20;

/// adnode miner daemon
#[derive(Parser, Debug)]
#[command(name = "adnode-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the node configuration file
    #[arg(short, long, default_value = "adnode.toml")]
    config: PathBuf,

    /// Path to PID file (overrides `daemon.pid_file`)
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Path to the operator socket (overrides `daemon.operator_socket`)
    #[arg(long)]
    operator_socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Port for the Prometheus metrics endpoint (loopback only)
    #[arg(long, default_value_t = DEFAULT_METRICS_PORT)]
    metrics_port: u16,

    /// Disable the Prometheus metrics endpoint
    #[arg(long)]
    no_metrics: bool,
}

/// Why the main loop ended.
enum Exit {
    Shutdown,
    HandedOver(Version),
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = NodeConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.apply_process_env();
    if let Some(pid_file) = &args.pid_file {
        config.daemon.pid_file.clone_from(pid_file);
    }
    if let Some(socket) = &args.operator_socket {
        config.daemon.operator_socket.clone_from(socket);
    }
    config.validate()?;
    Ok(config)
}

fn secret_from_env(var: &str) -> Option<SecretString> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.is_empty())
        .map(SecretString::from)
}

async fn async_main(args: Args) -> Result<()> {
    init_logging(&args)?;

    // Both the endpoint and the backend client build rustls configs.
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let config = Arc::new(load_config(&args)?);
    info!(
        version = adnode_core::NODE_VERSION,
        hotkey = %config.identity.hotkey,
        network = %config.identity.network,
        "adnode starting"
    );

    let inherited = Inherited::from_env(&config.daemon.lock_file)
        .await
        .context("failed to adopt resources from the previous process")?;
    let (mut lock, listener, readiness) = match inherited {
        Some(inherited) => {
            info!("starting as update successor");
            (inherited.lock, inherited.listener, Some(inherited.channel))
        },
        None => {
            let lock = NodeInstanceLock::acquire(&config.daemon.lock_file)?;
            let addr = SocketAddr::new(config.endpoint.bind_address, config.endpoint.port);
            (lock, bind_listener(addr)?, None)
        },
    };

    // =========================================================================
    // State
    // =========================================================================

    std::fs::create_dir_all(&config.daemon.state_dir).with_context(|| {
        format!(
            "failed to create state directory {}",
            config.daemon.state_dir.display()
        )
    })?;
    let store = Arc::new(
        NodeStore::open(&config.database_path()).context("failed to open state database")?,
    );
    let registry = Arc::new(
        LinkRegistry::load(Arc::clone(&store), config.links.ttl)
            .context("failed to load campaign links")?,
    );

    let metrics_registry =
        new_shared_registry().context("failed to initialize metrics registry")?;
    let metrics = metrics_registry.node_metrics().clone();

    let update_roots = match &config.update.ca_cert {
        Some(path) => load_certificates(path).context("failed to load update.ca_cert")?,
        None => Vec::new(),
    };
    let backend = Arc::new(HttpBackend::new(BackendSettings {
        base_url: config.forward.backend_url.clone(),
        api_key: config.forward.api_key_env.as_deref().and_then(secret_from_env),
        hotkey: config.identity.hotkey.clone(),
        manifest_url: config.update.manifest_url.clone(),
        request_timeout: config.forward.request_timeout,
        update_roots,
    }));

    let (queue, queue_rx) = ForwardQueue::channel(config.forward.queue_capacity);
    let forwarder = Arc::new(
        Forwarder::new(
            backend.clone(),
            Arc::clone(&store),
            ForwardPolicy::from(&config.forward),
        )
        .with_observer(Arc::new(metrics.clone())),
    );
    let engine = Arc::new(AttributionEngine::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        &config.attribution,
        Arc::new(SystemClock),
        queue,
    ));
    let seeded = engine
        .seed_from_store()
        .context("failed to seed the dedup window")?;
    let codes = Arc::new(TwoFactorBook::new(
        Arc::clone(&store),
        config.two_factor.code_ttl,
    ));

    // =========================================================================
    // HTTPS endpoint
    // =========================================================================

    let acceptor = load_acceptor(&config.endpoint.cert_path, &config.endpoint.key_path)?;
    let registration_secret = secret_from_env(&config.endpoint.registration_secret_env);
    if registration_secret.is_none() {
        warn!(
            var = %config.endpoint.registration_secret_env,
            "registration secret not set, two-factor delivery disabled"
        );
    }
    let app = router(AppState {
        engine: Arc::clone(&engine),
        codes: Arc::clone(&codes),
        redirects: Arc::new(RedirectPolicy::from_config(&config.attribution)),
        registration_secret: registration_secret.map(Arc::new),
        metrics: metrics.clone(),
    });
    let control = EndpointControl::new(true);
    let endpoint = SecureEndpoint::new(
        listener,
        acceptor,
        app,
        Arc::clone(&control),
        ConnectionLimits {
            max_connections: config.endpoint.max_connections,
            handshake_timeout: config.endpoint.handshake_timeout,
        },
    )?;

    if let Some(mut channel) = readiness {
        match channel
            .report_ready(&Version::current())
            .await
            .context("handover readiness exchange failed")?
        {
            Decision::Commit => channel
                .confirm()
                .await
                .context("failed to acknowledge handover")?,
            Decision::Abort => {
                warn!("previous process aborted the handover, exiting");
                lock.hand_over();
                return Ok(());
            },
        }
        lock.record_pid()?;
        info!("took over serving from the previous process");
    }

    forwarder
        .park_leftovers()
        .context("failed to park leftover credits")?;
    match sync_links_once(&registry, backend.as_ref(), &metrics).await {
        Ok(report) => info!(
            issued = report.issued,
            revoked = report.revoked,
            unchanged = report.unchanged,
            rejected = report.rejected,
            "campaign links ready"
        ),
        Err(e) => warn!(error = %e, "campaign sync failed, serving persisted links"),
    }
    metrics.set_links_active(registry.active_count());
    info!(
        active_links = registry.active_count(),
        seeded_pairs = seeded,
        "state loaded"
    );

    // =========================================================================
    // Update supervisor
    // =========================================================================

    let supervisor = if config.update.enabled {
        let launcher = ProcessLauncher::new(
            std::env::args_os().skip(1).collect(),
            endpoint.as_raw_fd(),
            lock.as_raw_fd(),
            config.handover_socket(),
        );
        Some(Arc::new(UpdateSupervisor::new(
            Version::current(),
            backend.clone(),
            backend.clone(),
            Arc::new(EndpointServing::new(
                Arc::clone(&control),
                Arc::clone(&store),
            )),
            Arc::new(launcher),
            config.artifact_dir(),
            UpdateTimings {
                drain_grace: config.update.drain_grace,
                fetch_timeout: config.update.fetch_timeout,
                health_timeout: config.update.health_timeout,
            },
        )))
    } else {
        info!("self-update disabled");
        None
    };

    let state = NodeState::new(NodeParts {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        registry: Arc::clone(&registry),
        engine,
        operator: OperatorChannel::new(Arc::clone(&registry), codes),
        forwarder: Arc::clone(&forwarder),
        supervisor: supervisor.clone(),
        endpoint: Arc::clone(&control),
        metrics: metrics.clone(),
    });

    // =========================================================================
    // Tasks
    // =========================================================================

    let forwarder_task =
        tokio::spawn(Arc::clone(&forwarder).run(queue_rx, state.shutdown_signal()));
    tokio::spawn(run_reconcile(
        Arc::clone(&forwarder),
        config.forward.reconcile_interval,
        state.shutdown_signal(),
    ));
    tokio::spawn(run_link_sync(
        Arc::clone(&registry),
        backend.clone(),
        metrics.clone(),
        config.links.refresh_interval,
        state.shutdown_signal(),
    ));
    let endpoint_task = tokio::spawn(endpoint.serve(state.shutdown_signal()));

    let operator = OperatorSocket::bind(&config.daemon.operator_socket)
        .context("failed to bind operator socket")?;
    let operator_task = tokio::spawn({
        let state = Arc::clone(&state);
        let shutdown = state.shutdown_signal();
        async move { operator.serve(state, shutdown).await }
    });

    if let Some(supervisor) = &supervisor {
        let metrics = metrics.clone();
        tokio::spawn(Arc::clone(supervisor).run(
            config.update.check_interval,
            state.shutdown_signal(),
            move |result| match result {
                Ok(outcome) => metrics.update_check(outcome.label()),
                Err(e) => metrics.update_check(e.label()),
            },
        ));
    }

    if args.no_metrics {
        info!("metrics endpoint disabled");
    } else {
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), args.metrics_port);
        tokio::spawn(serve_metrics_with_retry(metrics_registry, addr));
    }

    write_pid_file(&config.daemon.pid_file)?;

    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => info!(signal = name, "received signal"),
            Err(e) => error!(error = %e, "failed to register signal handlers"),
        }
        signal_state.request_shutdown();
    });

    info!(
        port = config.endpoint.port,
        operator_socket = %config.daemon.operator_socket.display(),
        "adnode running"
    );

    // =========================================================================
    // Exit
    // =========================================================================

    let mut shutdown = state.shutdown_signal();
    let exit = tokio::select! {
        _ = shutdown.wait_for(|requested| *requested) => Exit::Shutdown,
        version = wait_for_handover(supervisor.as_ref().map(|s| s.handover_signal())) => {
            Exit::HandedOver(version)
        },
    };

    if matches!(exit, Exit::Shutdown) {
        info!("shutting down");
        control.pause();
        let report = control.drain(config.update.drain_grace).await;
        info!(
            completed = report.completed,
            aborted = report.aborted,
            "in-flight requests drained"
        );
    }
    state.request_shutdown();

    if let Err(e) = forwarder_task.await {
        error!(error = %e, "forwarder task failed");
    }
    let _ = endpoint_task.await;
    let _ = operator_task.await;

    let flush_store = Arc::clone(&store);
    match tokio::task::spawn_blocking(move || flush_store.flush()).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => error!(error = %e, "final flush failed"),
        Err(e) => error!(error = %e, "final flush task failed"),
    }

    match exit {
        Exit::Shutdown => {
            remove_pid_file(&config.daemon.pid_file);
            lock.release()?;
            info!("adnode stopped");
        },
        Exit::HandedOver(version) => {
            lock.hand_over();
            info!(version = %version, "adnode exited after handover");
        },
    }
    Ok(())
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

async fn wait_for_handover(signal: Option<watch::Receiver<Option<Version>>>) -> Version {
    if let Some(mut signal) = signal {
        if let Ok(version) = signal.wait_for(Option::is_some).await {
            if let Some(version) = version.clone() {
                return version;
            }
        }
    }
    std::future::pending().await
}

async fn serve_metrics_with_retry(registry: SharedMetricsRegistry, addr: SocketAddr) {
    for attempt in 1..=METRICS_BIND_ATTEMPTS {
        match adnode_daemon::metrics::serve_metrics(Arc::clone(&registry), addr).await {
            Ok(()) => return,
            Err(e) if attempt < METRICS_BIND_ATTEMPTS => {
                warn!(%addr, attempt, error = %e, "metrics endpoint unavailable, retrying");
                tokio::time::sleep(Duration::from_millis(500)).await;
            },
            Err(e) => error!(%addr, error = %e, "metrics endpoint disabled"),
        }
    }
}
