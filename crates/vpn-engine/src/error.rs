//! Error taxonomy
//!
//! Every failure reported by a connector, an obfuscation wrapper or the
//! attempt sequencing itself is a [`ConnectionError`]. Before the
//! orchestrator reacts, the error is classified against the current
//! connection mode into an [`ErrorDisposition`]:
//!
//! | Class | Examples | Automatic mode | Manual mode |
//! |-------|----------|----------------|-------------|
//! | Always fatal | no tunnel device, helper won't start | surface on disconnect | surface on disconnect |
//! | OS integration | keychain, hosts file, preferences | retry | surface now |
//! | Retryable | UDP/TCP transport errors | retry | retry |
//! | Authentication | server rejected credentials | retry (or surface if opted in) | same |

use crate::candidate::ConnectionMode;
use crate::config::ConfigError;

/// Errors raised while establishing or holding a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("No usable tunnel device installed")]
    NoTunnelDevice,

    #[error("All tunnel devices are in use")]
    AllTunnelDevicesInUse,

    #[error("Cannot start tunnel helper process: {0}")]
    CantRunHelper(String),

    #[error("No socket to the local tunnel helper")]
    NoHelperSocket,

    #[error("Cannot open custom configuration: {0}")]
    CannotOpenCustomConfig(String),

    #[error("OS integration failure: {0}")]
    OsIntegration(OsIntegrationError),

    #[error("UDP socket cannot assign requested address")]
    UdpCantAssign,

    #[error("UDP socket has no buffer space")]
    UdpNoBufferSpace,

    #[error("Network is down")]
    UdpNetworkDown,

    #[error("TCP transport error")]
    TcpError,

    #[error("Connection error reported by tunnel helper")]
    ConnectedError,

    #[error("Tunnel came up with initialization errors")]
    ConnectedWithErrors,

    #[error("OS-managed tunnel failed to connect")]
    OsTunnelFailedToConnect,

    #[error("Obfuscation wrapper failed before ready: {0}")]
    WrapperFailed(String),

    #[error("Obfuscation wrapper exited unexpectedly")]
    WrapperExited,

    #[error("Authentication required")]
    AuthenticationRequired,
}

/// OS-specific preference, keychain and hosts-file failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OsIntegrationError {
    #[error("tunnel profile not found")]
    ProfileNotFound,

    #[error("failed to write tunnel profile entry")]
    ProfileEntryFailed,

    #[error("failed to modify hosts file")]
    HostsFileFailed,

    #[error("network extension not found")]
    NetworkExtensionMissing,

    #[error("failed to store credentials in keychain")]
    KeychainFailed,

    #[error("failed to start OS tunnel service")]
    ServiceStartFailed,

    #[error("failed to load tunnel preferences")]
    PreferencesLoadFailed,

    #[error("failed to save tunnel preferences")]
    PreferencesSaveFailed,
}

/// What the orchestrator does with a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Enter `ErrorDuringConnection`; surface once the connector is down.
    FatalDeferred,
    /// Surface right away and stop.
    FatalImmediate,
    /// Route through the failure classification (retry / fail over).
    Retryable,
}

impl ConnectionError {
    /// Classify against the active mode.
    ///
    /// `emit_auth_errors` is the caller's opt-in to receive authentication
    /// failures directly instead of having them retried.
    pub fn classify(&self, mode: ConnectionMode, emit_auth_errors: bool) -> ErrorDisposition {
        match self {
            ConnectionError::NoTunnelDevice
            | ConnectionError::AllTunnelDevicesInUse
            | ConnectionError::CantRunHelper(_)
            | ConnectionError::NoHelperSocket => ErrorDisposition::FatalDeferred,

            ConnectionError::CannotOpenCustomConfig(_) => ErrorDisposition::FatalImmediate,

            ConnectionError::OsIntegration(_) => match mode {
                ConnectionMode::Manual => ErrorDisposition::FatalImmediate,
                ConnectionMode::Automatic => ErrorDisposition::Retryable,
            },

            ConnectionError::AuthenticationRequired => {
                if emit_auth_errors {
                    ErrorDisposition::FatalDeferred
                } else {
                    ErrorDisposition::Retryable
                }
            }

            ConnectionError::UdpCantAssign
            | ConnectionError::UdpNoBufferSpace
            | ConnectionError::UdpNetworkDown
            | ConnectionError::TcpError
            | ConnectionError::ConnectedError
            | ConnectionError::ConnectedWithErrors
            | ConnectionError::OsTunnelFailedToConnect
            | ConnectionError::WrapperFailed(_)
            | ConnectionError::WrapperExited => ErrorDisposition::Retryable,
        }
    }

    /// The connector tears itself down after these; no stop request needed.
    pub fn connector_self_disconnects(&self) -> bool {
        matches!(self, ConnectionError::AuthenticationRequired)
    }

    /// Completion with errors leaves the adapter in a state that needs a reset.
    pub fn needs_adapter_reset(&self) -> bool {
        matches!(self, ConnectionError::ConnectedWithErrors)
    }
}

/// Errors returned by the orchestrator API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Connection already in progress (state: {0})")]
    AlreadyActive(&'static str),

    #[error("Previous connector still owns its socket")]
    ConnectorBusy,

    #[error("No connection candidates")]
    NoCandidates,

    #[error("No active connector")]
    NoConnector,

    #[error("Session is ending (state: {0})")]
    SessionEnding(&'static str),

    #[error("Orchestrator thread has stopped")]
    Stopped,

    #[error("Failed to spawn orchestrator thread: {0}")]
    Spawn(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_fatal_ignores_mode() {
        for mode in [ConnectionMode::Automatic, ConnectionMode::Manual] {
            assert_eq!(
                ConnectionError::NoTunnelDevice.classify(mode, false),
                ErrorDisposition::FatalDeferred
            );
            assert_eq!(
                ConnectionError::CantRunHelper("enoent".into()).classify(mode, false),
                ErrorDisposition::FatalDeferred
            );
        }
    }

    #[test]
    fn test_os_integration_depends_on_mode() {
        let err = ConnectionError::OsIntegration(OsIntegrationError::KeychainFailed);

        assert_eq!(err.classify(ConnectionMode::Manual, false), ErrorDisposition::FatalImmediate);
        assert_eq!(err.classify(ConnectionMode::Automatic, false), ErrorDisposition::Retryable);
    }

    #[test]
    fn test_auth_depends_on_opt_in() {
        let err = ConnectionError::AuthenticationRequired;

        assert_eq!(err.classify(ConnectionMode::Manual, false), ErrorDisposition::Retryable);
        assert_eq!(err.classify(ConnectionMode::Manual, true), ErrorDisposition::FatalDeferred);
        assert!(err.connector_self_disconnects());
    }

    #[test]
    fn test_transport_errors_retry() {
        for err in [
            ConnectionError::UdpNetworkDown,
            ConnectionError::TcpError,
            ConnectionError::ConnectedWithErrors,
            ConnectionError::WrapperFailed("exit 1".into()),
        ] {
            assert_eq!(err.classify(ConnectionMode::Manual, true), ErrorDisposition::Retryable);
        }
        assert!(ConnectionError::ConnectedWithErrors.needs_adapter_reset());
        assert!(!ConnectionError::TcpError.needs_adapter_reset());
    }
}
