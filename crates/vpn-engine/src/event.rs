//! Event types flowing into and out of the orchestrator.
//!
//! Inbound events are delivered serially on the orchestrator's control
//! thread. Every collaborator callback carries the [`Generation`] of the
//! attempt it was issued for; callbacks from a superseded attempt are
//! discarded on arrival.

use crate::error::{ConnectionError, EngineError};
use crate::orchestrator::ConnectRequest;
use crate::protocol::Protocol;
use crate::wrapper::WrapperKind;
use crossbeam_channel::Sender;
use std::fmt;

/// Monotonically increasing token identifying one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// Signals raised by a connector.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorSignal {
    Connected,
    Disconnected,
    Reconnecting,
    Error(ConnectionError),
    Statistics {
        bytes_in: u64,
        bytes_out: u64,
        cumulative: bool,
    },
    RequestUsername,
    RequestPassword,
}

/// Signals raised by an obfuscation wrapper.
#[derive(Debug, Clone, PartialEq)]
pub enum WrapperSignal {
    /// Local listener accepts connections
    Ready,
    /// Could not reach ready
    Failed(String),
    /// Process exited after ready
    Exited,
}

/// Result of post-connect verification.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifierOutcome {
    /// Tunnel verified; carries the address observed through it
    Verified(String),
    Failed,
}

/// OS power transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    Sleep,
    Wake,
}

/// Requests from the surrounding application.
#[derive(Debug)]
pub enum Command {
    Connect {
        request: Box<ConnectRequest>,
        reply: Sender<Result<(), EngineError>>,
    },
    Disconnect,
    ContinueWithCredentials {
        username: String,
        password: String,
        reconnect_needed: bool,
    },
    ContinueWithPassword {
        password: String,
    },
    ResetCandidates,
    SetMss(Option<u16>),
    Shutdown,
}

/// Everything the orchestrator reacts to.
#[derive(Debug)]
pub enum Event {
    Connector {
        generation: Generation,
        signal: ConnectorSignal,
    },
    Wrapper {
        generation: Generation,
        kind: WrapperKind,
        signal: WrapperSignal,
    },
    Verifier {
        generation: Generation,
        outcome: VerifierOutcome,
    },
    Network {
        online: bool,
        interface: String,
    },
    Power(PowerEvent),
    ReconnectionTimerExpired {
        timer: u64,
    },
    Command(Command),
}

impl Event {
    /// Callback from a collaborator bound to an attempt.
    pub fn generation(&self) -> Option<Generation> {
        match self {
            Event::Connector { generation, .. }
            | Event::Wrapper { generation, .. }
            | Event::Verifier { generation, .. } => Some(*generation),
            _ => None,
        }
    }
}

/// Why the machine reached `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ByUser,
    ByItself,
    ByReconnectionTimeout,
    WithError,
}

/// Lifecycle events emitted to the GUI / telemetry.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connected,
    Reconnecting,
    Disconnected(DisconnectReason),
    ErrorDuringConnection(ConnectionError),
    StatisticsUpdated {
        bytes_in: u64,
        bytes_out: u64,
        cumulative: bool,
    },
    RequestUsername {
        context: String,
    },
    RequestPassword {
        context: String,
    },
    ProtocolPortChanged {
        protocol: Protocol,
        port: u16,
    },
    ConnectingToHostname(String),
    ShowFailedAutomaticConnectionMessage,
    TunnelVerification {
        success: bool,
        address: Option<String>,
    },
    InternetConnectivityChanged(bool),
}

/// Generation-stamped handle collaborators use to report back.
///
/// A fresh sink is handed out for every attempt, so anything a
/// collaborator sends after being superseded arrives with a stale token.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<Event>,
    generation: Generation,
}

impl EventSink {
    pub fn new(tx: Sender<Event>, generation: Generation) -> Self {
        Self { tx, generation }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns `false` once the orchestrator is gone.
    pub fn connector(&self, signal: ConnectorSignal) -> bool {
        self.tx
            .send(Event::Connector {
                generation: self.generation,
                signal,
            })
            .is_ok()
    }

    pub fn wrapper(&self, kind: WrapperKind, signal: WrapperSignal) -> bool {
        self.tx
            .send(Event::Wrapper {
                generation: self.generation,
                kind,
                signal,
            })
            .is_ok()
    }

    pub fn verifier(&self, outcome: VerifierOutcome) -> bool {
        self.tx
            .send(Event::Verifier {
                generation: self.generation,
                outcome,
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_sink_stamps_generation() {
        let (tx, rx) = unbounded();
        let sink = EventSink::new(tx, Generation(7));

        assert!(sink.connector(ConnectorSignal::Connected));
        assert!(sink.verifier(VerifierOutcome::Failed));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.generation(), Some(Generation(7)));
        assert!(matches!(first, Event::Connector { signal: ConnectorSignal::Connected, .. }));
        assert_eq!(rx.try_recv().unwrap().generation(), Some(Generation(7)));
    }

    #[test]
    fn test_sink_reports_closed_channel() {
        let (tx, rx) = unbounded();
        let sink = EventSink::new(tx, Generation(1));
        drop(rx);

        assert!(!sink.wrapper(WrapperKind::Tls, WrapperSignal::Ready));
    }

    #[test]
    fn test_generation_ordering() {
        let g = Generation::default();
        assert!(g.next() > g);
        assert_eq!(g.next().to_string(), "gen#1");
        assert_eq!(Event::Power(PowerEvent::Sleep).generation(), None);
    }
}
