use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;

use link_share_lib::config::Config;
use link_share_lib::dns::DnsManager;
use link_share_lib::iface::{InterfaceManager, RealNetlinkOps};
use link_share_lib::logging::{self, LogReloadHandle};
use link_share_lib::protocol::{ConnectionContext, Engine, RealTransport};
use link_share_lib::route::{RealNfTablesOps, RealRouteOps, RouteManager};

mod cli;

// Avoid musl's default allocator due to degraded performance under many
// small concurrent allocations.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const NSSWITCH_PATH: &str = "/etc/nsswitch.conf";
const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

type RealEngine = Engine<RealRouteOps, RealNfTablesOps, RealNetlinkOps>;
type RealRoutes = RouteManager<RealRouteOps, RealNfTablesOps, RealNetlinkOps>;

/// Last-known state of one long-lived task, for the `SIGQUIT` stack dump.
#[derive(Clone, Debug)]
enum TaskState {
    Running,
    Sleeping,
    Exited(String),
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Running => write!(f, "running"),
            TaskState::Sleeping => write!(f, "sleeping"),
            TaskState::Exited(reason) => write!(f, "exited: {reason}"),
        }
    }
}

/// Shared registry of every spawned task's last-known state. Updated at
/// natural checkpoints inside each task; read only by the `SIGQUIT` handler.
#[derive(Clone, Default)]
struct TaskRegistry(Arc<Mutex<HashMap<String, TaskState>>>);

impl TaskRegistry {
    fn set(&self, name: &str, state: TaskState) {
        self.0.lock().unwrap().insert(name.to_string(), state);
    }

    fn dump(&self) {
        let tasks = self.0.lock().unwrap();
        eprintln!("link-share: {} long-lived task(s):", tasks.len());
        for (name, state) in tasks.iter() {
            eprintln!("  - {name}: {state}");
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from(cli::parse());

    let reload_handle = match logging::install(config.log_level, &config.log_path) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("failed to initialize logging at {}: {e}", config.log_path.display());
            process::exit(exitcode::IOERR);
        }
    };

    tracing::info!(version = env!("CARGO_PKG_NAME"), "starting link-share");

    if let Err(code) = run(config, reload_handle).await {
        tracing::warn!("abnormal exit");
        process::exit(code);
    }
}

async fn run(config: Config, reload_handle: LogReloadHandle) -> Result<(), exitcode::ExitCode> {
    write_pid_file(&config.pid_file).await?;

    let ifaces = Arc::new(InterfaceManager::new(open_netlink_ops()?));
    ifaces.enumerate().await.map_err(|e| {
        tracing::error!(error = %e, "failed to enumerate interfaces");
        exitcode::OSFILE
    })?;

    let routes = Arc::new(RouteManager::new(
        open_route_ops()?,
        RealNfTablesOps::new(),
        ifaces.clone(),
    ));
    routes.init().await.map_err(|e| {
        tracing::error!(error = %e, "failed to prime the learned-route table");
        exitcode::OSFILE
    })?;

    let dns = DnsManager::detect(Path::new(NSSWITCH_PATH), Path::new(RESOLV_CONF_PATH)).await.map_err(|e| {
        tracing::error!(error = %e, "failed to detect a DNS back-end");
        exitcode::UNAVAILABLE
    })?;

    let engine = Arc::new(RealEngine::new(
        routes.clone(),
        ifaces.clone(),
        dns,
        config.multicast_group,
        config.multicast_port,
        config.poll_interval,
    ));

    let (mut tasks, registry) = spawn_workers(&config, &ifaces, &routes, &engine).await?;

    tracing::info!(connections = engine.connection_count().await, "link-share ready");

    wait_for_signal(&reload_handle, &config, &registry).await;

    tracing::info!("shutting down");
    shutdown(&routes, &engine).await;
    remove_pid_file(&config.pid_file).await;
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}

    Ok(())
}

fn open_netlink_ops() -> Result<RealNetlinkOps, exitcode::ExitCode> {
    let (conn, handle, _) = rtnetlink::new_connection().map_err(|e| {
        tracing::error!(error = %e, "failed to open netlink connection");
        exitcode::OSFILE
    })?;
    tokio::spawn(conn);
    Ok(RealNetlinkOps::new(handle))
}

fn open_route_ops() -> Result<RealRouteOps, exitcode::ExitCode> {
    let (conn, handle, _) = rtnetlink::new_connection().map_err(|e| {
        tracing::error!(error = %e, "failed to open netlink connection for routes");
        exitcode::OSFILE
    })?;
    tokio::spawn(conn);
    Ok(RealRouteOps::new(handle))
}

/// Join the multicast group on every STANDARD interface, register each as a
/// connection, and spawn the daemon's long-lived tasks. Returns the task set
/// alongside the task registry the `SIGQUIT` handler reads.
async fn spawn_workers(
    config: &Config,
    ifaces: &Arc<InterfaceManager<RealNetlinkOps>>,
    routes: &Arc<RealRoutes>,
    engine: &Arc<RealEngine>,
) -> Result<(JoinSet<()>, TaskRegistry), exitcode::ExitCode> {
    let mut tasks = JoinSet::new();
    let registry = TaskRegistry::default();

    let standard_ifaces = ifaces
        .get_interfaces()
        .await
        .into_iter()
        .filter(|iface| iface.class == link_share_lib::iface::Class::Standard);

    for iface in standard_ifaces {
        let link_name = iface.name.clone();
        let transport = RealTransport::join(config.multicast_group, config.multicast_port, iface.index)
            .map_err(|e| {
                tracing::error!(error = %e, link = %link_name, "failed to join multicast group");
                exitcode::OSFILE
            })?;
        let local_addrs = ifaces.get_addresses(iface.index).await.map_err(|e| {
            tracing::error!(error = %e, link = %link_name, "failed to enumerate link addresses");
            exitcode::OSFILE
        })?;
        let ctx = ConnectionContext { interface: iface, local_addrs, transport: Arc::new(transport) };
        engine.add_connection(ctx.clone()).await;

        let engine = engine.clone();
        let task_name = format!("connection:{link_name}");
        registry.set(&task_name, TaskState::Running);
        let registry = registry.clone();
        tasks.spawn(async move {
            if let Err(e) = engine.run_connection(ctx).await {
                tracing::error!(error = %e, link = %link_name, "connection task exited");
                registry.set(&task_name, TaskState::Exited(e.to_string()));
            }
        });
    }

    {
        let ifaces = ifaces.clone();
        let task_name = "interface-monitor".to_string();
        registry.set(&task_name, TaskState::Running);
        let registry = registry.clone();
        tasks.spawn(async move {
            if let Err(e) = ifaces.monitor().await {
                tracing::error!(error = %e, "interface monitor exited");
                registry.set(&task_name, TaskState::Exited(e.to_string()));
            }
        });
    }
    {
        let routes = routes.clone();
        let task_name = "route-monitor".to_string();
        registry.set(&task_name, TaskState::Running);
        let registry = registry.clone();
        tasks.spawn(async move {
            if let Err(e) = routes.monitor().await {
                tracing::error!(error = %e, "route monitor exited");
                registry.set(&task_name, TaskState::Exited(e.to_string()));
            }
        });
    }
    {
        let engine = engine.clone();
        let task_name = "advertise-on-update".to_string();
        registry.set(&task_name, TaskState::Running);
        let registry = registry.clone();
        tasks.spawn(async move {
            if let Err(e) = engine.run_advertise_on_update().await {
                tracing::error!(error = %e, "advertise-on-update task exited");
                registry.set(&task_name, TaskState::Exited(e.to_string()));
            }
        });
    }
    {
        let engine = engine.clone();
        let poll_interval = config.poll_interval;
        let task_name = "helo-driver".to_string();
        registry.set(&task_name, TaskState::Sleeping);
        let registry = registry.clone();
        tasks.spawn(async move {
            loop {
                registry.set(&task_name, TaskState::Sleeping);
                tokio::time::sleep(poll_interval).await;
                registry.set(&task_name, TaskState::Running);
                if let Err(e) = engine.send_helo().await {
                    tracing::warn!(error = %e, "periodic helo failed");
                }
                engine.host_accounting().await;
            }
        });
    }

    Ok((tasks, registry))
}

/// Blocks until a shutdown-worthy signal arrives. `SIGHUP` reopens the log
/// file in place and loops; `SIGQUIT` dumps the long-lived task registry to
/// stderr and exits immediately, without running the orderly shutdown
/// sequence. `SIGINT`/`SIGTERM`/`SIGUSR1` return to the caller so it can run
/// the orderly shutdown.
async fn wait_for_signal(reload_handle: &LogReloadHandle, config: &Config, registry: &TaskRegistry) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigusr1 = signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");
    let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    loop {
        tokio::select! {
            _ = sigint.recv() => { tracing::info!("received SIGINT"); return; }
            _ = sigterm.recv() => { tracing::info!("received SIGTERM"); return; }
            _ = sigusr1.recv() => { tracing::info!("received SIGUSR1"); return; }
            _ = sighup.recv() => {
                tracing::debug!("received SIGHUP, reopening log file");
                if let Err(e) = logging::reopen(reload_handle, &config.log_path) {
                    tracing::warn!(error = %e, "failed to reopen log file");
                }
            }
            _ = sigquit.recv() => {
                registry.dump();
                process::exit(0);
            }
        }
    }
}

/// Roll back DNS, remove every self-installed route, and disable forwarding.
async fn shutdown(routes: &RealRoutes, engine: &RealEngine) {
    if let Err(e) = engine.dns_restore().await {
        tracing::warn!(error = %e, "dns restore on shutdown failed");
    }
    if let Err(e) = routes.shutdown().await {
        tracing::warn!(error = %e, "route cleanup on shutdown failed");
    }
}

async fn write_pid_file(path: &std::path::Path) -> Result<(), exitcode::ExitCode> {
    tokio::fs::write(path, process::id().to_string()).await.map_err(|e| {
        tracing::error!(error = %e, path = %path.display(), "failed to write pid file");
        exitcode::IOERR
    })
}

async fn remove_pid_file(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(error = %e, path = %path.display(), "failed to remove pid file");
    }
}
