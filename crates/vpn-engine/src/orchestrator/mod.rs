//! Connection orchestrator
//!
//! The single owner of the connection state machine. Every input (user
//! commands, collaborator callbacks, OS notifications, timer expiry) is an
//! [`Event`] handled to completion before the next one starts, so a
//! transition never observes another one half-done.
//!
//! The orchestrator can be driven directly through [`ConnectionOrchestrator::handle`]
//! or hosted on its own thread with [`spawn_orchestrator`].
//!
//! # Attempts
//!
//! Each attempt gets a fresh [`Generation`]. Collaborators only ever see a
//! generation-stamped [`EventSink`], so callbacks from a superseded attempt
//! are discarded on arrival rather than acted upon.

mod host;
mod sequence;
mod transitions;


pub use host::{OrchestratorHandle, spawn_orchestrator};

use crate::candidate::{CandidateSet, Credentials};
use crate::config::EngineConfig;
use crate::connector::{Connector, ConnectorFactory, DefaultConnectorFactory, OsTunnelService};
use crate::descriptor::{ConnectionDescriptor, ProxySettings, ServerCredentials};
use crate::error::{ConnectionError, EngineError};
use crate::event::{Command, DisconnectReason, EngineEvent, Event, EventSink, Generation, PowerEvent};
use crate::hooks::ConnectionHooks;
use crate::network::NetworkState;
use crate::privileged::{CommandPrivilegedOps, PrivilegedOps};
use crate::state::{ConnectionState, OrchestratorState};
use crate::timer::ReconnectionTimer;
use crate::verifier::{ReachabilityVerifier, TunnelVerifier};
use crate::wrapper::{ObfuscationWrapper, TlsWrapper, WebSocketWrapper, WrapperKind};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Everything needed to start a user-initiated session.
#[derive(Debug)]
pub struct ConnectRequest {
    pub candidates: CandidateSet,
    pub server_credentials: ServerCredentials,
    pub proxy: Option<ProxySettings>,
    /// Surface authentication failures instead of retrying them
    pub emit_auth_errors: bool,
}

impl ConnectRequest {
    pub fn new(candidates: CandidateSet) -> Self {
        Self {
            candidates,
            server_credentials: ServerCredentials::default(),
            proxy: None,
            emit_auth_errors: false,
        }
    }

    pub fn with_credentials(mut self, server_credentials: ServerCredentials) -> Self {
        self.server_credentials = server_credentials;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }
}

/// Injected collaborators.
pub struct Collaborators {
    pub connectors: Box<dyn ConnectorFactory>,
    pub tls_wrapper: Box<dyn ObfuscationWrapper>,
    pub websocket_wrapper: Box<dyn ObfuscationWrapper>,
    pub verifier: Box<dyn TunnelVerifier>,
    pub network: Arc<dyn NetworkState>,
    pub privileged: Box<dyn PrivilegedOps>,
    pub hooks: Vec<Box<dyn ConnectionHooks>>,
}

impl Collaborators {
    /// Bundled process-backed adapters running on `runtime`.
    pub fn with_defaults(
        config: &EngineConfig,
        runtime: Handle,
        network: Arc<dyn NetworkState>,
        os_service: Arc<dyn OsTunnelService>,
    ) -> Self {
        Self {
            connectors: Box::new(DefaultConnectorFactory::new(
                runtime.clone(),
                config.direct.clone(),
                os_service,
            )),
            tls_wrapper: Box::new(TlsWrapper::new(runtime.clone(), &config.wrappers)),
            websocket_wrapper: Box::new(WebSocketWrapper::new(runtime.clone(), &config.wrappers)),
            verifier: Box::new(ReachabilityVerifier::new(runtime, config.verifier.clone())),
            network,
            privileged: Box::new(CommandPrivilegedOps::new(config.privileged.clone())),
            hooks: Vec::new(),
        }
    }
}

/// Per-session inputs that are not candidates.
#[derive(Debug)]
struct Session {
    server_credentials: ServerCredentials,
    proxy: Option<ProxySettings>,
    emit_auth_errors: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptPhase {
    AwaitingWrapper(WrapperKind),
    ConnectorStarted,
    Verifying,
    Verified,
}

#[derive(Debug)]
struct Attempt {
    descriptor: Arc<ConnectionDescriptor>,
    phase: AttemptPhase,
}

pub struct ConnectionOrchestrator {
    config: EngineConfig,
    collab: Collaborators,

    inbox_tx: Sender<Event>,
    inbox: Receiver<Event>,
    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,

    st: OrchestratorState,
    candidates: Option<CandidateSet>,
    session: Option<Session>,

    connector: Option<Box<dyn Connector>>,
    /// Connector started and its `Disconnected` not yet seen
    connector_live: bool,
    generation: Generation,
    attempt: Option<Attempt>,
    timer: ReconnectionTimer,

    /// Fatal error waiting for the connector to go down
    latest_error: Option<ConnectionError>,
    custom_credentials: Option<Credentials>,
    /// Start a fresh attempt once the live connector is down
    restart_pending: bool,
    hooks_entered: bool,
    /// Privileged restore owed for the current connector session
    restore_due: bool,
    mss: Option<u16>,

    /// External events that arrived during a blocking teardown
    deferred: VecDeque<Event>,
}

impl ConnectionOrchestrator {
    pub fn new(config: EngineConfig, collab: Collaborators) -> Result<Self, EngineError> {
        config.validate()?;

        let (inbox_tx, inbox) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let timer = ReconnectionTimer::new(config.reconnection_timeout());

        Ok(Self {
            config,
            collab,
            inbox_tx,
            inbox,
            events_tx,
            events_rx,
            st: OrchestratorState::default(),
            candidates: None,
            session: None,
            connector: None,
            connector_live: false,
            generation: Generation::default(),
            attempt: None,
            timer,
            latest_error: None,
            custom_credentials: None,
            restart_pending: false,
            hooks_entered: false,
            restore_due: false,
            mss: None,
            deferred: VecDeque::new(),
        })
    }

    /// Sender for OS notifications and commands.
    pub fn sender(&self) -> Sender<Event> {
        self.inbox_tx.clone()
    }

    /// Receiver of lifecycle events.
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.events_rx.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.st.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// No connector exists or the existing one reports itself down.
    pub fn is_disconnected(&self) -> bool {
        self.connector.as_ref().is_none_or(|c| c.is_disconnected())
    }

    pub fn last_connected_ip(&self) -> Option<IpAddr> {
        self.st.last_ip
    }

    pub fn connected_adapter_name(&self) -> Option<String> {
        if self.st.state != ConnectionState::Connected {
            return None;
        }
        self.connector.as_ref().and_then(|c| c.adapter_name())
    }

    /// Snapshot of the attempt in flight.
    pub fn current_descriptor(&self) -> Option<Arc<ConnectionDescriptor>> {
        self.attempt.as_ref().map(|a| a.descriptor.clone())
    }

    pub fn candidates(&self) -> Option<&CandidateSet> {
        self.candidates.as_ref()
    }

    pub fn reconnection_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Expiry event for the armed timer once its deadline has passed.
    pub fn due_timer_event(&self, now: Instant) -> Option<Event> {
        if !self.timer.is_due(now) {
            return None;
        }
        self.timer
            .id()
            .map(|timer| Event::ReconnectionTimerExpired { timer })
    }

    /// MSS override applied to descriptors of later attempts.
    pub fn set_mss(&mut self, mss: Option<u16>) {
        self.mss = mss;
    }

    /// Start a user-initiated session. Only legal from `Disconnected`.
    pub fn connect(&mut self, request: ConnectRequest) -> Result<(), EngineError> {
        if self.st.state != ConnectionState::Disconnected {
            return Err(EngineError::AlreadyActive(self.st.state.name()));
        }
        if self.connector_live {
            return Err(EngineError::ConnectorBusy);
        }

        info!(
            "Connect requested ({:?} mode, {} candidates)",
            request.candidates.mode(),
            request.candidates.len()
        );

        self.candidates = Some(request.candidates);
        self.session = Some(Session {
            server_credentials: request.server_credentials,
            proxy: request.proxy,
            emit_auth_errors: request.emit_auth_errors,
        });
        self.st.had_success = false;
        self.st.adapter_reset_pending = false;
        self.st.last_online = self.collab.network.is_online();
        self.latest_error = None;
        self.custom_credentials = None;
        self.restart_pending = false;

        self.set_state(ConnectionState::ConnectingUserInitiated);
        self.do_connect();
        Ok(())
    }

    /// User-initiated disconnect. A no-op when already disconnected.
    pub fn disconnect(&mut self) {
        match self.st.state {
            ConnectionState::Disconnected => {
                debug!("Disconnect ignored, already disconnected");
                return;
            }
            ConnectionState::DisconnectingUserInitiated => return,
            _ => {}
        }

        info!("Disconnect requested in {}", self.st.state);
        self.timer.cancel();
        self.restart_pending = false;
        self.set_state(ConnectionState::DisconnectingUserInitiated);
        self.collab.verifier.stop();
        self.stop_wrappers();

        if self.connector_live {
            self.stop_connector();
        } else {
            self.release_attempt_resources();
            self.enter_disconnected(DisconnectReason::ByUser);
        }
    }

    /// Answer a username/password prompt.
    ///
    /// With `reconnect_needed` the answer is kept for the next attempt and a
    /// fresh attempt is sequenced once the live connector is down. Rejected
    /// once the session is ending or suspended.
    pub fn continue_with_credentials(
        &mut self,
        username: &str,
        password: &str,
        reconnect_needed: bool,
    ) -> Result<(), EngineError> {
        match self.st.state {
            ConnectionState::Disconnected => return Err(EngineError::NoConnector),
            state if state.is_winding_down() || state == ConnectionState::SleepPendingReconnect => {
                info!("Ignoring credentials in {}", state);
                return Err(EngineError::SessionEnding(state.name()));
            }
            _ => {}
        }
        self.custom_credentials = Some(Credentials::new(username, password));

        if !reconnect_needed {
            let connector = self.connector.as_mut().ok_or(EngineError::NoConnector)?;
            connector.continue_with_credentials(username, password);
            return Ok(());
        }

        info!("Reconnecting with supplied credentials");
        self.st.had_success = false;
        self.set_state(ConnectionState::ConnectingUserInitiated);
        if self.connector_live {
            self.restart_pending = true;
            self.stop_connector();
        } else {
            self.do_connect();
        }
        Ok(())
    }

    /// Answer a private-key password prompt.
    pub fn continue_with_password(&mut self, password: &str) -> Result<(), EngineError> {
        let connector = self.connector.as_mut().ok_or(EngineError::NoConnector)?;
        connector.continue_with_password(password);
        Ok(())
    }

    /// Rewind the candidate cursor and failure streak.
    pub fn reset_candidates(&mut self) {
        if let Some(candidates) = self.candidates.as_mut() {
            candidates.reset();
        }
    }

    /// Synchronous teardown for application shutdown.
    ///
    /// Bounded by `teardown_timeout`; ends in `Disconnected` without
    /// emitting an event.
    pub fn blocking_disconnect(&mut self) {
        info!("Blocking disconnect in {}", self.st.state);
        self.timer.cancel();
        self.restart_pending = false;
        self.blocking_teardown();
        self.candidates = None;
        self.attempt = None;
        self.st.state = ConnectionState::Disconnected;
    }

    /// Handle one event to completion, then any events deferred while it
    /// ran. Returns `false` once a shutdown command was processed.
    pub fn handle(&mut self, event: Event) -> bool {
        let mut keep_running = self.dispatch(event);
        while keep_running {
            match self.deferred.pop_front() {
                Some(event) => keep_running = self.dispatch(event),
                None => break,
            }
        }
        keep_running
    }

    /// Drain whatever is queued in the inbox right now.
    pub fn process_pending(&mut self) -> bool {
        while let Some(event) = self.deferred.pop_front() {
            if !self.dispatch(event) {
                return false;
            }
        }
        while let Ok(event) = self.inbox.try_recv() {
            if !self.handle(event) {
                return false;
            }
        }
        true
    }

    fn dispatch(&mut self, event: Event) -> bool {
        if let Some(generation) = event.generation() {
            if generation != self.generation {
                debug!(
                    "Discarding stale callback from {} (current {})",
                    generation, self.generation
                );
                return true;
            }
        }

        match event {
            Event::Connector { signal, .. } => self.on_connector_signal(signal),
            Event::Wrapper { kind, signal, .. } => self.on_wrapper_signal(kind, signal),
            Event::Verifier { outcome, .. } => self.on_verifier_outcome(outcome),
            Event::Network { online, interface } => self.on_network_changed(online, interface),
            Event::Power(PowerEvent::Sleep) => self.on_sleep(),
            Event::Power(PowerEvent::Wake) => self.on_wake(),
            Event::ReconnectionTimerExpired { timer } => self.on_timer_expired(timer),
            Event::Command(command) => return self.on_command(command),
        }
        true
    }

    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { request, reply } => {
                let result = self.connect(*request);
                if let Err(e) = &result {
                    warn!("Connect rejected: {}", e);
                }
                let _ = reply.send(result);
            }
            Command::Disconnect => self.disconnect(),
            Command::ContinueWithCredentials {
                username,
                password,
                reconnect_needed,
            } => {
                if let Err(e) = self.continue_with_credentials(&username, &password, reconnect_needed)
                {
                    warn!("Credentials not delivered: {}", e);
                }
            }
            Command::ContinueWithPassword { password } => {
                if let Err(e) = self.continue_with_password(&password) {
                    warn!("Password not delivered: {}", e);
                }
            }
            Command::ResetCandidates => self.reset_candidates(),
            Command::SetMss(mss) => self.set_mss(mss),
            Command::Shutdown => {
                self.blocking_disconnect();
                return false;
            }
        }
        true
    }

    fn sink(&self) -> EventSink {
        EventSink::new(self.inbox_tx.clone(), self.generation)
    }

    fn emit(&self, event: EngineEvent) {
        debug!("Emit {:?}", event);
        let _ = self.events_tx.send(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.st.state != state {
            debug!("State {} -> {} ({})", self.st.state, state, self.generation);
            self.st.state = state;
        }
    }

    fn wrapper_mut(&mut self, kind: WrapperKind) -> &mut Box<dyn ObfuscationWrapper> {
        match kind {
            WrapperKind::Tls => &mut self.collab.tls_wrapper,
            WrapperKind::WebSocket => &mut self.collab.websocket_wrapper,
        }
    }

    fn stop_wrappers(&mut self) {
        self.collab.tls_wrapper.stop();
        self.collab.websocket_wrapper.stop();
    }
}
