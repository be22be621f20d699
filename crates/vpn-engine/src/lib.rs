//! vpn-engine - VPN connection orchestration
//!
//! Drives a VPN session from the user's click to a verified tunnel and
//! keeps it alive across failures, network changes and sleep/wake.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                    Orchestrator thread                        │
//! │                                                               │
//! │  inbox ──▶ ConnectionOrchestrator ──▶ EngineEvent (GUI)       │
//! │   ▲          │        │        │                              │
//! │   │          ▼        ▼        ▼                              │
//! │   │     Connector  Wrapper  Verifier   (one attempt each,     │
//! │   │          │        │        │        generation-stamped)   │
//! │   └──────────┴────────┴────────┘                              │
//! │         signals via EventSink                                 │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Ordered failover**: candidates tried in rank order, bounded by a
//!   consecutive-failure threshold
//! - **Single connector**: never two tunnel instances alive at once
//! - **Stale callback rejection**: every attempt has its own generation
//! - **Bounded reconnection**: one session-wide timer, never extended
//! - **Sleep/wake**: synchronous, bounded teardown before suspend

mod candidate;
mod config;
mod descriptor;
mod error;
mod event;
mod hooks;
mod network;
mod orchestrator;
mod privileged;
mod protocol;
mod state;
mod timer;
mod verifier;

pub mod connector;
pub mod wrapper;

#[cfg(test)]
mod testkit;

pub use candidate::{
    Candidate, CandidateSet, CandidateSource, ConnectionMode, ConnectionSettings, Credentials,
    FailureOutcome, Location, LocationKind, PortMap, PortMapEntry, ServerNode,
};
pub use config::{
    ConfigError, DirectConfig, EngineConfig, PrivilegedConfig, VerifierConfig, WrapperConfig,
    WrapperProcessConfig,
};
pub use connector::{
    Connector, ConnectorFactory, ConnectorKind, DefaultConnectorFactory, OsTunnelService,
    OsTunnelStatus,
};
pub use descriptor::{
    AttemptContext, ConnectionDescriptor, ProxyKind, ProxySettings, ServerCredentials, SourceKind,
};
pub use error::{ConnectionError, EngineError, ErrorDisposition, OsIntegrationError};
pub use event::{
    Command, ConnectorSignal, DisconnectReason, EngineEvent, Event, EventSink, Generation,
    PowerEvent, VerifierOutcome, WrapperSignal,
};
pub use hooks::{ConnectionHooks, KillSwitch, KillSwitchState};
pub use network::{NetworkState, SharedNetworkState};
pub use orchestrator::{
    Collaborators, ConnectRequest, ConnectionOrchestrator, OrchestratorHandle, spawn_orchestrator,
};
pub use privileged::{CommandPrivilegedOps, PrivilegedError, PrivilegedOps, TeardownContext};
pub use protocol::Protocol;
pub use state::{ConnectionState, OrchestratorState};
pub use timer::ReconnectionTimer;
pub use verifier::{ProbeError, ReachabilityVerifier, TunnelVerifier, probe};
pub use wrapper::{ObfuscationWrapper, WrapperError, WrapperKind};
