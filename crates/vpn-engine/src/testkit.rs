//! Recording fakes for driving the orchestrator in tests.

use crate::candidate::{Candidate, CandidateSet, CandidateSource, ConnectionMode};
use crate::config::EngineConfig;
use crate::connector::{Connector, ConnectorFactory, ConnectorKind};
use crate::descriptor::ConnectionDescriptor;
use crate::event::{
    ConnectorSignal, EngineEvent, Event, EventSink, Generation, VerifierOutcome, WrapperSignal,
};
use crate::hooks::ConnectionHooks;
use crate::network::SharedNetworkState;
use crate::orchestrator::{Collaborators, ConnectRequest, ConnectionOrchestrator};
use crate::privileged::{PrivilegedError, PrivilegedOps, TeardownContext};
use crate::protocol::Protocol;
use crate::verifier::TunnelVerifier;
use crate::wrapper::{ObfuscationWrapper, WrapperKind};
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const TLS_PORT: u16 = 41_443;
pub const WEBSOCKET_PORT: u16 = 41_444;
pub const ADAPTER: &str = "tun7";

/// Calls made on the fakes, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ConnectorCreated(ConnectorKind),
    ConnectorStarted {
        generation: Generation,
        hostname: String,
        protocol: Protocol,
    },
    ConnectorStopped,
    ConnectorDropped(ConnectorKind),
    Credentials(String, String),
    Password(String),
    WrapperStarted(WrapperKind),
    WrapperStopped(WrapperKind),
    VerifierStarted(Generation),
    VerifierStopped,
    AdapterReset(String),
    Restored,
    HookEntered(String),
    HookLeft,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Call>>>);

impl Recorder {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Knobs for fake connectors; shared so tests can flip them mid-run.
#[derive(Debug)]
pub struct ConnectorBehaviour {
    /// Report `Disconnected` when asked to stop
    pub disconnect_on_stop: AtomicBool,
    /// Report `Connected` right after start
    pub connect_on_start: AtomicBool,
}

impl Default for ConnectorBehaviour {
    fn default() -> Self {
        Self {
            disconnect_on_stop: AtomicBool::new(true),
            connect_on_start: AtomicBool::new(false),
        }
    }
}

pub struct FakeConnectorFactory {
    recorder: Recorder,
    behaviour: Arc<ConnectorBehaviour>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl ConnectorFactory for FakeConnectorFactory {
    fn create(&mut self, kind: ConnectorKind) -> Box<dyn Connector> {
        self.recorder.push(Call::ConnectorCreated(kind));
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);
        Box::new(FakeConnector {
            kind,
            recorder: self.recorder.clone(),
            behaviour: self.behaviour.clone(),
            live: self.live.clone(),
            sink: None,
            disconnected: true,
        })
    }
}

pub struct FakeConnector {
    kind: ConnectorKind,
    recorder: Recorder,
    behaviour: Arc<ConnectorBehaviour>,
    live: Arc<AtomicUsize>,
    sink: Option<EventSink>,
    disconnected: bool,
}

impl Connector for FakeConnector {
    fn kind(&self) -> ConnectorKind {
        self.kind
    }

    fn start(&mut self, descriptor: Arc<ConnectionDescriptor>, events: EventSink) {
        self.recorder.push(Call::ConnectorStarted {
            generation: descriptor.generation,
            hostname: descriptor.hostname.clone(),
            protocol: descriptor.protocol,
        });
        self.disconnected = false;
        if self.behaviour.connect_on_start.load(Ordering::SeqCst) {
            events.connector(ConnectorSignal::Connected);
        }
        self.sink = Some(events);
    }

    fn stop(&mut self) {
        self.recorder.push(Call::ConnectorStopped);
        if self.disconnected || !self.behaviour.disconnect_on_stop.load(Ordering::SeqCst) {
            return;
        }
        self.disconnected = true;
        if let Some(sink) = &self.sink {
            sink.connector(ConnectorSignal::Disconnected);
        }
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    fn adapter_name(&self) -> Option<String> {
        (!self.disconnected).then(|| ADAPTER.to_string())
    }

    fn continue_with_credentials(&mut self, username: &str, password: &str) {
        self.recorder
            .push(Call::Credentials(username.to_string(), password.to_string()));
    }

    fn continue_with_password(&mut self, password: &str) {
        self.recorder.push(Call::Password(password.to_string()));
    }
}

impl Drop for FakeConnector {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.recorder.push(Call::ConnectorDropped(self.kind));
    }
}

pub struct FakeWrapper {
    kind: WrapperKind,
    port: u16,
    running: bool,
    recorder: Recorder,
}

impl ObfuscationWrapper for FakeWrapper {
    fn kind(&self) -> WrapperKind {
        self.kind
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn start(&mut self, _remote_host: &str, _remote_port: u16, _events: EventSink) {
        self.running = true;
        self.recorder.push(Call::WrapperStarted(self.kind));
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            self.recorder.push(Call::WrapperStopped(self.kind));
        }
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

pub struct FakeVerifier {
    running: bool,
    recorder: Recorder,
}

impl TunnelVerifier for FakeVerifier {
    fn start(&mut self, descriptor: &ConnectionDescriptor, _events: EventSink) {
        self.running = true;
        self.recorder.push(Call::VerifierStarted(descriptor.generation));
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            self.recorder.push(Call::VerifierStopped);
        }
    }
}

pub struct FakePrivileged {
    recorder: Recorder,
}

impl PrivilegedOps for FakePrivileged {
    fn reset_adapter(&mut self, adapter: &str) -> Result<(), PrivilegedError> {
        self.recorder.push(Call::AdapterReset(adapter.to_string()));
        Ok(())
    }

    fn restore_after_teardown(&mut self, _ctx: &TeardownContext) -> Result<(), PrivilegedError> {
        self.recorder.push(Call::Restored);
        Ok(())
    }
}

pub struct RecordingHook {
    recorder: Recorder,
}

impl ConnectionHooks for RecordingHook {
    fn on_entered_connected(&mut self, descriptor: &ConnectionDescriptor) {
        self.recorder.push(Call::HookEntered(descriptor.hostname.clone()));
    }

    fn on_left_connected(&mut self) {
        self.recorder.push(Call::HookLeft);
    }
}

/// Config with a short teardown bound.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        teardown_timeout_ms: 200,
        teardown_poll_ms: 5,
        ..EngineConfig::default()
    }
}

pub fn candidate(hostname: &str, last_octet: u8, protocol: Protocol) -> Candidate {
    Candidate {
        hostname: hostname.to_string(),
        ip: format!("198.51.100.{last_octet}").parse().unwrap(),
        dns_name: None,
        protocol,
        port: 443,
        source: CandidateSource::DefaultLocation,
    }
}

/// Orchestrator wired to fakes, driven synchronously.
pub struct TestBed {
    pub orch: ConnectionOrchestrator,
    pub recorder: Recorder,
    pub network: SharedNetworkState,
    pub behaviour: Arc<ConnectorBehaviour>,
    pub live: Arc<AtomicUsize>,
    pub max_live: Arc<AtomicUsize>,
    pub events: Receiver<EngineEvent>,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let recorder = Recorder::default();
        let network = SharedNetworkState::new(true);
        let behaviour = Arc::new(ConnectorBehaviour::default());
        let live = Arc::new(AtomicUsize::new(0));
        let max_live = Arc::new(AtomicUsize::new(0));

        let collab = Collaborators {
            connectors: Box::new(FakeConnectorFactory {
                recorder: recorder.clone(),
                behaviour: behaviour.clone(),
                live: live.clone(),
                max_live: max_live.clone(),
            }),
            tls_wrapper: Box::new(FakeWrapper {
                kind: WrapperKind::Tls,
                port: TLS_PORT,
                running: false,
                recorder: recorder.clone(),
            }),
            websocket_wrapper: Box::new(FakeWrapper {
                kind: WrapperKind::WebSocket,
                port: WEBSOCKET_PORT,
                running: false,
                recorder: recorder.clone(),
            }),
            verifier: Box::new(FakeVerifier {
                running: false,
                recorder: recorder.clone(),
            }),
            network: Arc::new(network.clone()),
            privileged: Box::new(FakePrivileged {
                recorder: recorder.clone(),
            }),
            hooks: vec![Box::new(RecordingHook {
                recorder: recorder.clone(),
            })],
        };

        let orch = ConnectionOrchestrator::new(config, collab).unwrap();
        let events = orch.events();
        Self {
            orch,
            recorder,
            network,
            behaviour,
            live,
            max_live,
            events,
        }
    }

    pub fn connect(&mut self, candidates: Vec<Candidate>, mode: ConnectionMode) {
        let set = CandidateSet::new(candidates, mode, 3).unwrap();
        self.orch.connect(ConnectRequest::new(set)).unwrap();
    }

    /// Deliver a connector signal stamped with the current generation.
    pub fn connector(&mut self, signal: ConnectorSignal) {
        let generation = self.orch.generation();
        self.orch.handle(Event::Connector { generation, signal });
    }

    pub fn wrapper(&mut self, kind: WrapperKind, signal: WrapperSignal) {
        let generation = self.orch.generation();
        self.orch.handle(Event::Wrapper {
            generation,
            kind,
            signal,
        });
    }

    pub fn verifier(&mut self, outcome: VerifierOutcome) {
        let generation = self.orch.generation();
        self.orch.handle(Event::Verifier {
            generation,
            outcome,
        });
    }

    /// Handle what the fakes queued.
    pub fn pump(&mut self) {
        self.orch.process_pending();
    }

    pub fn drain(&self) -> Vec<EngineEvent> {
        self.events.try_iter().collect()
    }

    pub fn started(&self) -> usize {
        self.recorder
            .count(|c| matches!(c, Call::ConnectorStarted { .. }))
    }

    pub fn started_hosts(&self) -> Vec<String> {
        self.recorder
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ConnectorStarted { hostname, .. } => Some(hostname),
                _ => None,
            })
            .collect()
    }
}
