//! Attempt sequencing: building descriptors, starting and stopping
//! collaborators, and the bounded synchronous teardown.

use super::{Attempt, AttemptPhase, ConnectionOrchestrator};
use crate::candidate::CandidateSource;
use crate::connector::ConnectorKind;
use crate::descriptor::{AttemptContext, ConnectionDescriptor, ServerCredentials};
use crate::error::ConnectionError;
use crate::event::{ConnectorSignal, DisconnectReason, EngineEvent, Event};
use crate::privileged::TeardownContext;
use crate::state::ConnectionState;
use crossbeam_channel::RecvTimeoutError;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

impl ConnectionOrchestrator {
    /// Start an attempt against the current candidate.
    pub(super) fn do_connect(&mut self) {
        if !self.collab.network.is_online() {
            info!("No network connectivity, waiting before connecting");
            self.set_state(ConnectionState::WaitingForNetwork);
            self.timer.start();
            return;
        }
        let Some(candidate) = self.candidates.as_ref().map(|c| c.current().clone()) else {
            warn!("Connect sequenced without candidates");
            self.enter_disconnected(DisconnectReason::ByItself);
            return;
        };

        self.generation = self.generation.next();
        self.st.error_latch = false;

        if let CandidateSource::CustomConfig { path } = &candidate.source {
            if let Err(e) = std::fs::File::open(path) {
                error!("Cannot open custom config {}: {}", path.display(), e);
                self.fail_immediately(ConnectionError::CannotOpenCustomConfig(
                    path.display().to_string(),
                ));
                return;
            }
        }

        let wrapper = candidate.protocol.wrapper();
        let wrapper_port = wrapper.map(|kind| self.wrapper_mut(kind).local_port());
        let no_credentials = ServerCredentials::default();
        let session = self.session.as_ref();
        let descriptor = Arc::new(ConnectionDescriptor::for_attempt(
            &candidate,
            AttemptContext {
                generation: self.generation,
                server_credentials: session.map_or(&no_credentials, |s| &s.server_credentials),
                custom_credentials: self.custom_credentials.as_ref(),
                wrapper_port,
                proxy: session.and_then(|s| s.proxy.as_ref()),
                mss: self.mss,
            },
        ));

        info!(
            "Connecting to {} ({}) via {} port {} [{}]",
            candidate.hostname, candidate.ip, candidate.protocol, candidate.port, self.generation
        );
        self.emit(EngineEvent::ProtocolPortChanged {
            protocol: candidate.protocol,
            port: candidate.port,
        });
        self.emit(EngineEvent::ConnectingToHostname(candidate.hostname.clone()));

        match wrapper {
            Some(kind) => {
                self.attempt = Some(Attempt {
                    descriptor,
                    phase: AttemptPhase::AwaitingWrapper(kind),
                });
                let sink = self.sink();
                let host = candidate.ip.to_string();
                self.wrapper_mut(kind).start(&host, candidate.port, sink);
            }
            None => {
                self.attempt = Some(Attempt {
                    descriptor,
                    phase: AttemptPhase::ConnectorStarted,
                });
                self.start_connector();
            }
        }
    }

    pub(super) fn start_connector(&mut self) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.phase = AttemptPhase::ConnectorStarted;
        let descriptor = attempt.descriptor.clone();

        if self.connector_live {
            warn!("Previous connector still live, dropping it");
            self.drop_connector();
        }
        self.recreate_connector(descriptor.protocol.connector_kind());

        let sink = self.sink();
        if let Some(connector) = self.connector.as_mut() {
            connector.start(descriptor, sink);
            self.connector_live = true;
            self.restore_due = true;
        }
    }

    /// Keep the instance if it already matches `kind`, otherwise replace it.
    /// The old instance is gone before the new one exists.
    fn recreate_connector(&mut self, kind: ConnectorKind) {
        if self.connector.as_ref().is_some_and(|c| c.kind() == kind) {
            return;
        }
        self.drop_connector();
        debug!("Creating {:?} connector", kind);
        self.connector = Some(self.collab.connectors.create(kind));
    }

    fn drop_connector(&mut self) {
        if let Some(mut connector) = self.connector.take() {
            debug!("Destroying {:?} connector", connector.kind());
            connector.stop();
        }
        self.connector_live = false;
    }

    pub(super) fn stop_connector(&mut self) {
        if let Some(connector) = self.connector.as_mut() {
            connector.stop();
        }
    }

    /// Undo what the attempt set up besides the connector itself.
    pub(super) fn release_attempt_resources(&mut self) {
        self.collab.verifier.stop();
        self.stop_wrappers();

        if self.hooks_entered {
            self.hooks_entered = false;
            for hook in self.collab.hooks.iter_mut() {
                hook.on_left_connected();
            }
        }

        if self.restore_due {
            self.restore_due = false;
            let ctx = TeardownContext {
                adapter: self.st.last_adapter.clone(),
                server_ip: self.attempt.as_ref().map(|a| a.descriptor.ip),
            };
            match self.collab.privileged.restore_after_teardown(&ctx) {
                Ok(()) => debug!("Network configuration restored"),
                Err(e) => warn!("Restoring network configuration failed: {}", e),
            }
        }
    }

    pub(super) fn reset_adapter_if_pending(&mut self) {
        if !self.st.adapter_reset_pending {
            return;
        }
        self.st.adapter_reset_pending = false;

        let Some(adapter) = self.st.last_adapter.clone() else {
            debug!("Adapter reset requested but no adapter is known");
            return;
        };
        match self.collab.privileged.reset_adapter(&adapter) {
            Ok(()) => info!("Adapter {} reset", adapter),
            Err(e) => warn!("Resetting adapter {} failed: {}", adapter, e),
        }
    }

    pub(super) fn fail_immediately(&mut self, err: ConnectionError) {
        self.timer.cancel();
        if self.connector_live {
            self.stop_connector();
        }
        self.release_attempt_resources();
        self.emit(EngineEvent::ErrorDuringConnection(err));
        self.enter_disconnected(DisconnectReason::WithError);
    }

    pub(super) fn enter_disconnected(&mut self, reason: DisconnectReason) {
        info!("Disconnected ({:?})", reason);
        self.timer.cancel();
        self.collab.verifier.stop();
        self.stop_wrappers();
        if self.connector_live {
            self.stop_connector();
        }

        self.candidates = None;
        self.attempt = None;
        self.latest_error = None;
        self.restart_pending = false;
        self.set_state(ConnectionState::Disconnected);
        self.emit(EngineEvent::Disconnected(reason));
    }

    /// Stop everything and wait, bounded by `teardown_timeout`, for the
    /// connector to report itself down. A connector that does not make it in
    /// time is dropped so the next attempt starts from a fresh instance.
    pub(super) fn blocking_teardown(&mut self) {
        self.collab.verifier.stop();
        self.stop_wrappers();

        if self.connector_live {
            self.stop_connector();

            let timeout = self.config.teardown_timeout();
            let poll = self.config.teardown_poll();
            let deadline = Instant::now() + timeout;

            while self.connector_live && !self.is_disconnected() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match self.inbox.recv_timeout(poll.min(deadline - now)) {
                    Ok(event) => self.absorb_during_teardown(event),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            if self.connector_live && !self.is_disconnected() {
                warn!("Connector did not stop within {:?}, dropping it", timeout);
                self.drop_connector();
            }
            self.connector_live = false;
        }

        self.release_attempt_resources();
    }

    fn absorb_during_teardown(&mut self, event: Event) {
        match event.generation() {
            Some(generation) if generation == self.generation => {
                if matches!(
                    event,
                    Event::Connector {
                        signal: ConnectorSignal::Disconnected,
                        ..
                    }
                ) {
                    debug!("Connector down during teardown");
                    self.connector_live = false;
                } else {
                    debug!("Dropping {:?} during teardown", event);
                }
            }
            Some(generation) => debug!("Discarding stale callback from {}", generation),
            None => self.deferred.push_back(event),
        }
    }
}
