//! OS-managed connector
//!
//! For protocols the operating system implements itself (IKEv2). The
//! platform glue lives behind [`OsTunnelService`]; this connector installs
//! the profile, starts the tunnel and polls its status on the runtime.

use super::{Connector, ConnectorKind};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{ConnectionError, OsIntegrationError};
use crate::event::{ConnectorSignal, EventSink};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Status as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsTunnelStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Platform tunnel service (profile store plus the OS VPN client).
pub trait OsTunnelService: Send + Sync {
    fn install_profile(&self, descriptor: &ConnectionDescriptor) -> Result<(), OsIntegrationError>;

    fn start(&self) -> Result<(), OsIntegrationError>;

    fn stop(&self);

    fn status(&self) -> OsTunnelStatus;

    fn adapter_name(&self) -> Option<String> {
        None
    }

    /// Cumulative (in, out) byte counters, if the platform exposes them
    fn statistics(&self) -> Option<(u64, u64)> {
        None
    }
}

pub struct OsManagedConnector {
    runtime: Handle,
    service: Arc<dyn OsTunnelService>,
    poll_interval: Duration,
    connect_timeout: Duration,
    stop_tx: Option<mpsc::UnboundedSender<()>>,
    disconnected: Arc<AtomicBool>,
}

impl OsManagedConnector {
    pub fn new(runtime: Handle, service: Arc<dyn OsTunnelService>) -> Self {
        Self {
            runtime,
            service,
            poll_interval: POLL_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            stop_tx: None,
            disconnected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, connect_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Connector for OsManagedConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::OsManaged
    }

    fn start(&mut self, descriptor: Arc<ConnectionDescriptor>, events: EventSink) {
        self.stop();

        let (tx, rx) = mpsc::unbounded_channel();
        self.stop_tx = Some(tx);
        self.disconnected = Arc::new(AtomicBool::new(false));

        let monitor = Monitor {
            service: self.service.clone(),
            events,
            disconnected: self.disconnected.clone(),
            poll_interval: self.poll_interval,
            connect_timeout: self.connect_timeout,
        };
        self.runtime.spawn(monitor.run(descriptor, rx));
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }

    fn adapter_name(&self) -> Option<String> {
        self.service.adapter_name()
    }

    fn continue_with_credentials(&mut self, _username: &str, _password: &str) {
        debug!("OS-managed tunnel does not prompt for credentials");
    }

    fn continue_with_password(&mut self, _password: &str) {
        debug!("OS-managed tunnel does not prompt for a password");
    }
}

impl Drop for OsManagedConnector {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Monitor {
    service: Arc<dyn OsTunnelService>,
    events: EventSink,
    disconnected: Arc<AtomicBool>,
    poll_interval: Duration,
    connect_timeout: Duration,
}

impl Monitor {
    async fn run(self, descriptor: Arc<ConnectionDescriptor>, mut stop_rx: mpsc::UnboundedReceiver<()>) {
        let service = self.service.clone();
        let setup = tokio::task::spawn_blocking(move || {
            service.install_profile(&descriptor)?;
            service.start()
        })
        .await;

        match setup {
            Ok(Ok(())) => info!("OS tunnel started ({})", self.events.generation()),
            Ok(Err(e)) => {
                warn!("OS tunnel setup failed: {}", e);
                self.events
                    .connector(ConnectorSignal::Error(ConnectionError::OsIntegration(e)));
                self.finish();
                return;
            }
            Err(e) => {
                warn!("OS tunnel setup task failed: {}", e);
                self.events
                    .connector(ConnectorSignal::Error(ConnectionError::OsTunnelFailedToConnect));
                self.finish();
                return;
            }
        }

        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut seen_active = false;
        let mut connected = false;

        loop {
            let stop_requested = tokio::select! {
                _ = ticker.tick() => false,
                _ = stop_rx.recv() => true,
            };
            if stop_requested {
                debug!("Stopping OS tunnel");
                self.service.stop();
                break;
            }

            match self.service.status() {
                OsTunnelStatus::Connected => {
                    seen_active = true;
                    if !connected {
                        connected = true;
                        self.events.connector(ConnectorSignal::Connected);
                    } else if let Some((bytes_in, bytes_out)) = self.service.statistics() {
                        self.events.connector(ConnectorSignal::Statistics {
                            bytes_in,
                            bytes_out,
                            cumulative: true,
                        });
                    }
                }
                OsTunnelStatus::Connecting => {
                    seen_active = true;
                    if !connected && started.elapsed() >= self.connect_timeout {
                        warn!("OS tunnel did not connect within {:?}", self.connect_timeout);
                        self.events.connector(ConnectorSignal::Error(
                            ConnectionError::OsTunnelFailedToConnect,
                        ));
                        self.service.stop();
                        break;
                    }
                }
                OsTunnelStatus::Failed => {
                    let err = if connected {
                        ConnectionError::ConnectedError
                    } else {
                        ConnectionError::OsTunnelFailedToConnect
                    };
                    self.events.connector(ConnectorSignal::Error(err));
                    self.service.stop();
                    break;
                }
                OsTunnelStatus::Disconnected => {
                    if seen_active {
                        info!("OS tunnel went down");
                        break;
                    }
                    if started.elapsed() >= self.connect_timeout {
                        self.events.connector(ConnectorSignal::Error(
                            ConnectionError::OsTunnelFailedToConnect,
                        ));
                        break;
                    }
                }
            }
        }

        self.finish();
    }

    fn finish(&self) {
        self.disconnected.store(true, Ordering::Relaxed);
        self.events.connector(ConnectorSignal::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Candidate, CandidateSource};
    use crate::descriptor::{AttemptContext, ServerCredentials};
    use crate::event::{Event, Generation};
    use crate::protocol::Protocol;
    use crossbeam_channel::{Receiver, unbounded};
    use std::sync::Mutex;

    struct FakeService {
        status: Mutex<OsTunnelStatus>,
        install: Result<(), OsIntegrationError>,
        stops: Mutex<u32>,
    }

    impl FakeService {
        fn new(install: Result<(), OsIntegrationError>) -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(OsTunnelStatus::Disconnected),
                install,
                stops: Mutex::new(0),
            })
        }

        fn set(&self, status: OsTunnelStatus) {
            *self.status.lock().unwrap() = status;
        }
    }

    impl OsTunnelService for FakeService {
        fn install_profile(&self, _: &ConnectionDescriptor) -> Result<(), OsIntegrationError> {
            self.install.clone()
        }

        fn start(&self) -> Result<(), OsIntegrationError> {
            let mut status = self.status.lock().unwrap();
            if *status == OsTunnelStatus::Disconnected {
                *status = OsTunnelStatus::Connecting;
            }
            Ok(())
        }

        fn stop(&self) {
            *self.stops.lock().unwrap() += 1;
            self.set(OsTunnelStatus::Disconnected);
        }

        fn status(&self) -> OsTunnelStatus {
            *self.status.lock().unwrap()
        }
    }

    fn descriptor() -> Arc<ConnectionDescriptor> {
        let candidate = Candidate {
            hostname: "us-nyc-01.example.net".into(),
            ip: "198.51.100.20".parse().unwrap(),
            dns_name: Some("us-nyc-01.example.net".into()),
            protocol: Protocol::Ikev2,
            port: 500,
            source: CandidateSource::DefaultLocation,
        };
        let server = ServerCredentials::default();
        Arc::new(ConnectionDescriptor::for_attempt(
            &candidate,
            AttemptContext {
                generation: Generation(1),
                server_credentials: &server,
                custom_credentials: None,
                wrapper_port: None,
                proxy: None,
                mss: None,
            },
        ))
    }

    fn next_signal(rx: &Receiver<Event>) -> ConnectorSignal {
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Connector { signal, .. } => signal,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_then_stop() {
        let service = FakeService::new(Ok(()));
        let mut connector = OsManagedConnector::new(Handle::current(), service.clone())
            .with_timing(Duration::from_millis(10), Duration::from_secs(5));
        let (tx, rx) = unbounded();

        connector.start(descriptor(), EventSink::new(tx, Generation(1)));
        assert!(!connector.is_disconnected());

        service.set(OsTunnelStatus::Connected);
        assert_eq!(next_signal(&rx), ConnectorSignal::Connected);

        connector.stop();
        connector.stop();
        assert_eq!(next_signal(&rx), ConnectorSignal::Disconnected);
        assert!(connector.is_disconnected());
        assert_eq!(*service.stops.lock().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_profile_failure_is_reported() {
        let service = FakeService::new(Err(OsIntegrationError::ProfileEntryFailed));
        let mut connector = OsManagedConnector::new(Handle::current(), service);
        let (tx, rx) = unbounded();

        connector.start(descriptor(), EventSink::new(tx, Generation(1)));

        assert_eq!(
            next_signal(&rx),
            ConnectorSignal::Error(ConnectionError::OsIntegration(
                OsIntegrationError::ProfileEntryFailed
            ))
        );
        assert_eq!(next_signal(&rx), ConnectorSignal::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_timeout() {
        let service = FakeService::new(Ok(()));
        let mut connector = OsManagedConnector::new(Handle::current(), service)
            .with_timing(Duration::from_millis(5), Duration::from_millis(50));
        let (tx, rx) = unbounded();

        connector.start(descriptor(), EventSink::new(tx, Generation(1)));

        assert_eq!(
            next_signal(&rx),
            ConnectorSignal::Error(ConnectionError::OsTunnelFailedToConnect)
        );
        assert_eq!(next_signal(&rx), ConnectorSignal::Disconnected);
    }
}
