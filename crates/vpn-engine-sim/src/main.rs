//! vpn-engine-sim: drive one VPN session from a session file
//!
//! Loads the engine configuration plus a location and connection settings,
//! connects, and logs lifecycle events until the session ends or the run
//! time is over.
//!
//! ```text
//! vpn-engine-sim session.toml
//! ```

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vpn_engine::{
    CandidateSet, Collaborators, ConnectRequest, ConnectionDescriptor, ConnectionOrchestrator,
    ConnectionSettings, EngineConfig, EngineEvent, KillSwitch, Location, OsIntegrationError,
    OsTunnelService, OsTunnelStatus, PortMap, ProxySettings, ServerCredentials,
    SharedNetworkState, spawn_orchestrator,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Deserialize)]
struct Session {
    #[serde(default)]
    engine: EngineConfig,
    location: Location,
    settings: ConnectionSettings,
    #[serde(default)]
    port_map: PortMap,
    #[serde(default)]
    credentials: ServerCredentials,
    #[serde(default)]
    proxy: Option<ProxySettings>,
    #[serde(default)]
    kill_switch: bool,
    #[serde(default = "default_run_secs")]
    run_secs: u64,
}

fn default_run_secs() -> u64 {
    60
}

/// Platform tunnels are not available in the simulator.
struct NoOsTunnels;

impl OsTunnelService for NoOsTunnels {
    fn install_profile(&self, _: &ConnectionDescriptor) -> Result<(), OsIntegrationError> {
        Err(OsIntegrationError::ServiceStartFailed)
    }

    fn start(&self) -> Result<(), OsIntegrationError> {
        Err(OsIntegrationError::ServiceStartFailed)
    }

    fn stop(&self) {}

    fn status(&self) -> OsTunnelStatus {
        OsTunnelStatus::Disconnected
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let Some(path) = std::env::args().nth(1).map(PathBuf::from) else {
        bail!("usage: vpn-engine-sim <session.toml>");
    };
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let session: Session =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("vpn-engine-io")
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let candidates = CandidateSet::build(
        &session.location,
        &session.settings,
        &session.port_map,
        session.proxy.is_some(),
        session.engine.failure_threshold,
    )?;

    let network = Arc::new(SharedNetworkState::new(true));
    let mut collab = Collaborators::with_defaults(
        &session.engine,
        runtime.handle().clone(),
        network,
        Arc::new(NoOsTunnels),
    );
    let kill_switch = KillSwitch::new(session.kill_switch);
    collab.hooks.push(Box::new(kill_switch.clone()));

    let orchestrator = ConnectionOrchestrator::new(session.engine.clone(), collab)?;
    let handle = spawn_orchestrator(orchestrator)?;

    let mut request = ConnectRequest::new(candidates).with_credentials(session.credentials);
    if let Some(proxy) = session.proxy {
        request = request.with_proxy(proxy);
    }
    handle.connect(request)?;

    let deadline = Instant::now() + Duration::from_secs(session.run_secs);
    while let Ok(event) = handle.events().recv_deadline(deadline) {
        match &event {
            EngineEvent::Disconnected(reason) => {
                info!("Session ended: {:?}", reason);
                break;
            }
            EngineEvent::ErrorDuringConnection(err) => warn!("Connection error: {}", err),
            EngineEvent::TunnelVerification { success, address } => {
                info!(
                    "Tunnel verification {} ({})",
                    if *success { "passed" } else { "failed" },
                    address.as_deref().unwrap_or("-")
                );
            }
            other => info!("{:?} (kill switch {:?})", other, kill_switch.state()),
        }
    }

    handle.shutdown();
    runtime.shutdown_timeout(Duration::from_secs(1));
    info!("vpn-engine-sim done");
    Ok(())
}
