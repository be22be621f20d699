//! Reactions to collaborator callbacks and OS notifications.

use super::{AttemptPhase, ConnectionOrchestrator};
use crate::candidate::{ConnectionMode, FailureOutcome};
use crate::error::{ConnectionError, ErrorDisposition};
use crate::event::{ConnectorSignal, DisconnectReason, EngineEvent, VerifierOutcome, WrapperSignal};
use crate::state::ConnectionState;
use crate::wrapper::WrapperKind;
use tracing::{debug, error, info, warn};

impl ConnectionOrchestrator {
    pub(super) fn on_connector_signal(&mut self, signal: ConnectorSignal) {
        match signal {
            ConnectorSignal::Connected => self.on_connector_connected(),
            ConnectorSignal::Disconnected => self.on_connector_disconnected(),
            ConnectorSignal::Reconnecting => self.on_connector_reconnecting(),
            ConnectorSignal::Error(err) => self.on_connection_error(err),
            ConnectorSignal::Statistics {
                bytes_in,
                bytes_out,
                cumulative,
            } => self.emit(EngineEvent::StatisticsUpdated {
                bytes_in,
                bytes_out,
                cumulative,
            }),
            ConnectorSignal::RequestUsername => {
                let context = self.prompt_context();
                self.emit(EngineEvent::RequestUsername { context });
            }
            ConnectorSignal::RequestPassword => {
                let context = self.prompt_context();
                self.emit(EngineEvent::RequestPassword { context });
            }
        }
    }

    fn prompt_context(&self) -> String {
        self.attempt
            .as_ref()
            .map(|a| a.descriptor.prompt_context())
            .unwrap_or_default()
    }

    fn on_connector_connected(&mut self) {
        if !self.st.state.is_attempting() {
            debug!("Ignoring connected signal in {}", self.st.state);
            return;
        }
        let Some(attempt) = self.attempt.as_mut() else {
            warn!("Connected signal without an attempt");
            return;
        };
        attempt.phase = AttemptPhase::Verifying;
        let descriptor = attempt.descriptor.clone();

        info!(
            "Connected to {} ({}) via {} port {}",
            descriptor.hostname, descriptor.ip, descriptor.protocol, descriptor.port
        );
        self.timer.cancel();
        self.set_state(ConnectionState::Connected);
        self.st.last_ip = Some(descriptor.ip);
        self.st.last_protocol = Some(descriptor.protocol);
        if let Some(adapter) = self.connector.as_ref().and_then(|c| c.adapter_name()) {
            self.st.last_adapter = Some(adapter);
        }

        for hook in self.collab.hooks.iter_mut() {
            hook.on_entered_connected(&descriptor);
        }
        self.hooks_entered = true;

        let sink = self.sink();
        self.collab.verifier.start(&descriptor, sink);
        self.emit(EngineEvent::Connected);
    }

    /// The live connector is down; sequence whatever the state asks for next.
    pub(super) fn on_connector_disconnected(&mut self) {
        self.connector_live = false;
        self.release_attempt_resources();

        match self.st.state {
            ConnectionState::DisconnectingUserInitiated => {
                self.enter_disconnected(DisconnectReason::ByUser)
            }
            ConnectionState::Connected => {
                info!("Connection dropped, reconnecting");
                self.set_state(ConnectionState::Reconnecting);
                self.emit(EngineEvent::Reconnecting);
                self.timer.start();
                self.do_connect();
            }
            ConnectionState::ConnectingUserInitiated => {
                if self.restart_pending {
                    self.restart_pending = false;
                    self.do_connect();
                } else {
                    self.enter_disconnected(DisconnectReason::ByItself);
                }
            }
            ConnectionState::AutoDisconnected => self.enter_disconnected(DisconnectReason::ByItself),
            ConnectionState::ErrorDuringConnection => {
                if let Some(err) = self.latest_error.take() {
                    self.emit(EngineEvent::ErrorDuringConnection(err));
                }
                self.enter_disconnected(DisconnectReason::WithError);
            }
            ConnectionState::Reconnecting => {
                self.reset_adapter_if_pending();
                self.do_connect();
            }
            ConnectionState::ReconnectionTimeExceeded => {
                self.enter_disconnected(DisconnectReason::ByReconnectionTimeout)
            }
            ConnectionState::WakeReconnecting => {
                self.set_state(ConnectionState::Reconnecting);
                self.timer.start();
                self.do_connect();
            }
            ConnectionState::Disconnected
            | ConnectionState::WaitingForNetwork
            | ConnectionState::SleepPendingReconnect => {
                debug!("Connector down in {}", self.st.state)
            }
        }
    }

    fn on_connector_reconnecting(&mut self) {
        let state = self.st.state;
        if !(state.is_attempting() || state == ConnectionState::Connected) {
            debug!("Ignoring reconnecting signal in {}", state);
            return;
        }
        if self.st.error_latch {
            debug!("Attempt {} already failed", self.generation);
            return;
        }
        self.st.error_latch = true;
        self.collab.verifier.stop();

        if state == ConnectionState::Connected {
            info!("Connector lost the tunnel, reconnecting");
            self.set_state(ConnectionState::Reconnecting);
            self.emit(EngineEvent::Reconnecting);
            self.timer.start();
            self.stop_connector();
        } else {
            info!("Attempt {} failed", self.generation);
            self.classify_failure(true);
        }
    }

    /// Error from the connector or a wrapper. Only the first failure of an
    /// attempt is acted upon.
    pub(super) fn on_connection_error(&mut self, err: ConnectionError) {
        let state = self.st.state;
        if !(state.is_attempting() || state == ConnectionState::Connected) {
            debug!("Ignoring error {:?} in {}", err, state);
            return;
        }
        if self.st.error_latch {
            debug!("Ignoring error {:?}, attempt {} already failed", err, self.generation);
            return;
        }
        self.st.error_latch = true;
        self.collab.verifier.stop();

        let mode = self
            .candidates
            .as_ref()
            .map_or(ConnectionMode::Manual, |c| c.mode());
        let emit_auth_errors = self.session.as_ref().is_some_and(|s| s.emit_auth_errors);
        let self_disconnects = err.connector_self_disconnects();

        match err.classify(mode, emit_auth_errors) {
            ErrorDisposition::FatalDeferred => {
                error!("Connection error: {}", err);
                self.latest_error = Some(err);
                self.set_state(ConnectionState::ErrorDuringConnection);
                self.timer.cancel();
                self.finish_failed_attempt(!self_disconnects);
            }
            ErrorDisposition::FatalImmediate => {
                error!("Connection error: {}", err);
                self.fail_immediately(err);
            }
            ErrorDisposition::Retryable => {
                warn!("Connection error: {}, retrying", err);
                if err.needs_adapter_reset() {
                    self.st.adapter_reset_pending = true;
                    if let Some(adapter) = self.connector.as_ref().and_then(|c| c.adapter_name()) {
                        self.st.last_adapter = Some(adapter);
                    }
                }

                if state == ConnectionState::Connected {
                    self.set_state(ConnectionState::Reconnecting);
                    self.emit(EngineEvent::Reconnecting);
                    self.timer.start();
                    self.finish_failed_attempt(!self_disconnects);
                } else {
                    self.classify_failure(!self_disconnects);
                }
            }
        }
    }

    /// Record the failure against the candidate set and decide between
    /// another attempt and giving up.
    fn classify_failure(&mut self, stop_connector: bool) {
        let outcome = match self.candidates.as_mut() {
            Some(candidates) => candidates.record_failure(),
            None => FailureOutcome::Exhausted,
        };

        if outcome == FailureOutcome::HasMore || self.st.had_success {
            if outcome == FailureOutcome::Exhausted {
                info!("Candidates exhausted after a verified session, starting over");
                if let Some(candidates) = self.candidates.as_mut() {
                    candidates.reset();
                }
            }
            if self.st.state != ConnectionState::Reconnecting {
                self.set_state(ConnectionState::Reconnecting);
                self.emit(EngineEvent::Reconnecting);
            }
            self.timer.start();
        } else {
            warn!("All candidates failed");
            self.set_state(ConnectionState::AutoDisconnected);
            self.timer.cancel();
            self.emit(EngineEvent::ShowFailedAutomaticConnectionMessage);
        }

        self.finish_failed_attempt(stop_connector);
    }

    /// Bring the failed attempt down. The next step runs from
    /// `on_connector_disconnected` once the connector is gone.
    fn finish_failed_attempt(&mut self, stop_connector: bool) {
        if !self.connector_live {
            self.on_connector_disconnected();
        } else if stop_connector {
            self.stop_connector();
        } else {
            debug!("Waiting for the connector to go down on its own");
        }
    }

    pub(super) fn on_wrapper_signal(&mut self, kind: WrapperKind, signal: WrapperSignal) {
        let phase = self.attempt.as_ref().map(|a| a.phase);
        let awaiting = phase == Some(AttemptPhase::AwaitingWrapper(kind));

        match signal {
            WrapperSignal::Ready => {
                if !awaiting || !self.st.state.is_attempting() {
                    debug!("Ignoring ready from {} in {}", kind, self.st.state);
                    return;
                }
                debug!("{} ready", kind);
                self.start_connector();
            }
            WrapperSignal::Failed(reason) => {
                if !awaiting {
                    debug!("Ignoring failure of idle {}: {}", kind, reason);
                    return;
                }
                self.on_connection_error(ConnectionError::WrapperFailed(reason));
            }
            WrapperSignal::Exited => {
                let in_front = self
                    .attempt
                    .as_ref()
                    .is_some_and(|a| a.descriptor.protocol.wrapper() == Some(kind));
                if awaiting {
                    self.on_connection_error(ConnectionError::WrapperFailed(
                        "exited before ready".to_string(),
                    ));
                } else if in_front {
                    self.on_connection_error(ConnectionError::WrapperExited);
                } else {
                    debug!("{} exited while unused", kind);
                }
            }
        }
    }

    pub(super) fn on_verifier_outcome(&mut self, outcome: VerifierOutcome) {
        let verifying = self
            .attempt
            .as_ref()
            .is_some_and(|a| a.phase == AttemptPhase::Verifying);
        if self.st.state != ConnectionState::Connected || !verifying {
            debug!("Ignoring verifier outcome in {}", self.st.state);
            return;
        }

        match outcome {
            VerifierOutcome::Verified(address) => {
                self.mark_verified();
                self.st.had_success = true;
                if let Some(candidates) = self.candidates.as_mut() {
                    candidates.record_success();
                }
                self.emit(EngineEvent::TunnelVerification {
                    success: true,
                    address: Some(address),
                });
            }
            VerifierOutcome::Failed => {
                let automatic = self.candidates.as_ref().is_some_and(|c| c.is_automatic());
                if !automatic {
                    warn!("Tunnel verification failed, staying connected");
                    self.mark_verified();
                    self.emit(EngineEvent::TunnelVerification {
                        success: false,
                        address: None,
                    });
                    return;
                }
                if self.st.error_latch {
                    return;
                }
                self.st.error_latch = true;
                warn!("Tunnel verification failed, trying the next candidate");
                self.classify_failure(true);
            }
        }
    }

    fn mark_verified(&mut self) {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.phase = AttemptPhase::Verified;
        }
    }

    pub(super) fn on_network_changed(&mut self, online: bool, interface: String) {
        let previous = self.st.last_interface.clone();
        let interface_changed =
            online && previous.as_deref().is_some_and(|p| p != interface);

        if online != self.st.last_online {
            info!(
                "Internet connectivity {} ({})",
                if online { "restored" } else { "lost" },
                interface
            );
            self.emit(EngineEvent::InternetConnectivityChanged(online));
        }
        self.st.last_online = online;
        if online {
            self.st.last_interface = Some(interface.clone());
        }

        match self.st.state {
            state if state.is_attempting() && !online => {
                info!("Network down in {}, waiting", state);
                self.wait_for_network();
            }
            ConnectionState::Connected if !online => {
                info!("Network down while connected, waiting");
                self.emit(EngineEvent::Reconnecting);
                self.wait_for_network();
            }
            ConnectionState::Connected if interface_changed => {
                info!(
                    "Network interface changed ({} -> {}), reconnecting",
                    previous.unwrap_or_default(),
                    interface
                );
                self.set_state(ConnectionState::Reconnecting);
                self.emit(EngineEvent::Reconnecting);
                self.timer.start();
                self.collab.verifier.stop();
                self.stop_connector();
            }
            ConnectionState::WaitingForNetwork if online => {
                info!("Network is back, reconnecting");
                self.set_state(ConnectionState::Reconnecting);
                self.timer.start();
                if self.connector_live {
                    self.stop_connector();
                } else {
                    self.do_connect();
                }
            }
            _ => {}
        }
    }

    fn wait_for_network(&mut self) {
        self.set_state(ConnectionState::WaitingForNetwork);
        self.timer.start();
        self.collab.verifier.stop();
        self.stop_wrappers();
        if self.connector_live {
            self.stop_connector();
        }
    }

    pub(super) fn on_sleep(&mut self) {
        info!("System going to sleep in {}", self.st.state);
        self.timer.cancel();

        match self.st.state {
            ConnectionState::ConnectingUserInitiated
            | ConnectionState::Connected
            | ConnectionState::Reconnecting
            | ConnectionState::WakeReconnecting => {
                self.emit(EngineEvent::Reconnecting);
                self.blocking_teardown();
                self.set_state(ConnectionState::SleepPendingReconnect);
            }
            ConnectionState::WaitingForNetwork => {
                self.stop_wrappers();
                self.set_state(ConnectionState::SleepPendingReconnect);
            }
            _ => {}
        }
    }

    pub(super) fn on_wake(&mut self) {
        info!("System woke up in {}", self.st.state);
        if self.st.state != ConnectionState::SleepPendingReconnect {
            return;
        }

        self.timer.cancel();
        if self.st.last_online {
            self.set_state(ConnectionState::WakeReconnecting);
            self.timer.start();
            self.do_connect();
        } else {
            self.set_state(ConnectionState::WaitingForNetwork);
            self.timer.start();
        }
    }

    pub(super) fn on_timer_expired(&mut self, timer: u64) {
        if self.timer.id() != Some(timer) {
            debug!("Ignoring stale reconnection timer #{}", timer);
            return;
        }
        self.timer.cancel();

        match self.st.state {
            ConnectionState::ConnectingUserInitiated
            | ConnectionState::Reconnecting
            | ConnectionState::WakeReconnecting
            | ConnectionState::WaitingForNetwork => {}
            state => {
                debug!("Reconnection timer expired in {}", state);
                return;
            }
        }

        warn!("Reconnection time exceeded");
        self.set_state(ConnectionState::ReconnectionTimeExceeded);
        self.collab.verifier.stop();
        self.stop_wrappers();
        if self.connector_live {
            self.stop_connector();
        } else {
            self.release_attempt_resources();
            self.enter_disconnected(DisconnectReason::ByReconnectionTimeout);
        }
    }
}
