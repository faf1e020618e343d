//! exit-router: multi-exit egress steering daemon
//!
//! Provisions kernel routing for every configured exit, runs the health
//! monitor, serves the configured TCP forwards and removes all routing state
//! on SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./exit-router
//!
//! # Run with custom configuration
//! sudo ./exit-router -c /path/to/config.json
//!
//! # Run with environment overrides
//! EXIT_ROUTER_LOG_LEVEL=debug sudo ./exit-router
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use exit_router::config::{load_config_with_env, Config};
use exit_router::dialer::ExitDialer;
use exit_router::error::RoutingError;
use exit_router::forward::ForwardListener;
use exit_router::health::{ExitProbe, HealthMonitor, TcpConnectProbe};
use exit_router::pool::ExitPool;
use exit_router::routing::{has_net_admin_capability, is_root, LinuxBackend, RoutingManager};
use exit_router::selector::IpSelector;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/exit-router/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("exit-router v{}", exit_router::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"exit-router v{}

Multi-exit egress steering for proxy servers.

USAGE:
    exit-router [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/exit-router/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    EXIT_ROUTER_LOG_LEVEL          Override log level (trace, debug, info, warn, error)
    EXIT_ROUTER_SELECTOR           Override selector strategy
    EXIT_ROUTER_ROUTING_ENABLED    Enable or disable kernel steering (true/false)
    EXIT_ROUTER_HEALTH_INTERVAL    Override health check interval in seconds

REQUIREMENTS:
    - Linux with policy routing (iproute2) and iptables/ip6tables nat
    - CAP_NET_ADMIN capability (or root)
    - Every exit address assigned to its interface

EXAMPLE:
    exit-router -g -c /etc/exit-router/config.json
    sudo exit-router -c /etc/exit-router/config.json
"#,
        exit_router::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Check system prerequisites
fn check_prerequisites(config: &Config) {
    if config.routing.enabled && !is_root() && !has_net_admin_capability() {
        warn!("Not running as root and CAP_NET_ADMIN not detected");
        warn!("Kernel steering requires CAP_NET_ADMIN; exits will be excluded if setup fails");
    }
}

/// Provision routing for every exit on the blocking pool
async fn provision(routing: Arc<RoutingManager>, pool: Arc<ExitPool>) -> Result<()> {
    let result = tokio::task::spawn_blocking(move || routing.setup(&pool))
        .await
        .context("Routing setup task panicked")?;

    match result {
        Ok(()) => {}
        Err(RoutingError::SetupPartialFailure { failures }) => {
            for failure in &failures {
                error!(
                    exit = %failure.exit,
                    artifact = ?failure.artifact,
                    reason = %failure.reason,
                    "Exit excluded: routing setup failed"
                );
            }
        }
        Err(e) => warn!(error = %e, "Routing setup reported an error"),
    }
    Ok(())
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        exit_router::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).with_context(|| {
        format!("Failed to load configuration from {:?}", args.config_path)
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("exit-router v{}", exit_router::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    check_prerequisites(&config);

    // Pool and routing
    let pool = Arc::new(ExitPool::from_config(&config.exits));
    let routing = Arc::new(
        RoutingManager::new(&config.routing, Arc::new(LinuxBackend::new()))
            .context("Invalid routing configuration")?,
    );
    provision(Arc::clone(&routing), Arc::clone(&pool)).await?;

    let snapshot = pool.snapshot();
    info!(
        exits = snapshot.len(),
        selectable = snapshot.selectable_count(),
        strategy = %config.selector.strategy,
        routing = routing.is_enabled(),
        "Exit pool ready"
    );

    // Dialer
    let selector = Arc::new(IpSelector::from_config(&config.selector));
    let dialer = Arc::new(ExitDialer::new(
        Arc::clone(&pool),
        Arc::clone(&selector),
        Arc::clone(&routing),
        &config.dial,
    ));

    // Health monitor
    let monitor = if config.health_check.enabled {
        let probe: Arc<dyn ExitProbe> = Arc::new(TcpConnectProbe::new(
            config.health_check.probe_targets.clone(),
            config.health_check.timeout(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&pool),
            probe,
            &config.health_check,
        ));
        let handle = tokio::spawn(Arc::clone(&monitor).run());
        Some((monitor, handle))
    } else {
        info!("Health checking disabled");
        None
    };

    // Forwards
    let mut forwards: Vec<(Arc<ForwardListener>, JoinHandle<()>)> = Vec::new();
    for forward in &config.forwards {
        let listener = ForwardListener::bind(forward.clone(), Arc::clone(&dialer))
            .await
            .with_context(|| format!("Failed to bind forward '{}' on {}", forward.name, forward.listen))?;
        let listener = Arc::new(listener);
        let handle = tokio::spawn(Arc::clone(&listener).run());
        forwards.push((listener, handle));
    }

    info!(
        forwards = forwards.len(),
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    info!("Shutting down...");

    for (listener, handle) in forwards {
        listener.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        let stats = listener.stats();
        info!(
            forward = %stats.name,
            accepted = stats.accepted,
            dial_failures = stats.dial_failures,
            bytes_up = stats.bytes_client_to_target,
            bytes_down = stats.bytes_target_to_client,
            "Forward stopped"
        );
    }

    if let Some((monitor, handle)) = monitor {
        monitor.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    // Teardown follows the setup ledger regardless of current exit health
    let teardown = Arc::clone(&routing);
    match tokio::task::spawn_blocking(move || teardown.cleanup()).await {
        Ok(Ok(())) => info!("Routing state removed"),
        Ok(Err(e)) => error!(error = %e, "Routing cleanup incomplete"),
        Err(e) => error!(error = %e, "Routing cleanup task panicked"),
    }

    let stats = pool.stats();
    info!(
        total_connections = stats.total_connections(),
        active_connections = stats.active_connections(),
        "Final pool stats"
    );
    for exit in &stats.exits {
        info!(
            exit = %exit.address,
            total = exit.total_connections,
            failed_dials = exit.failed_dials,
            healthy = exit.healthy,
            "Exit summary"
        );
    }
    let dial_stats = dialer.stats();
    info!(
        dials = dial_stats.dials,
        established = dial_stats.established,
        bind_failures = dial_stats.bind_failures,
        connect_failures = dial_stats.connect_failures,
        "Final dialer stats"
    );

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
