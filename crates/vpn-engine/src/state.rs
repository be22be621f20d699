//! Orchestrator state

use crate::protocol::Protocol;
use std::net::IpAddr;

/// States of the connection machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    ConnectingUserInitiated,
    Connected,
    DisconnectingUserInitiated,
    Reconnecting,
    WaitingForNetwork,
    AutoDisconnected,
    ErrorDuringConnection,
    ReconnectionTimeExceeded,
    SleepPendingReconnect,
    WakeReconnecting,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::ConnectingUserInitiated => "ConnectingUserInitiated",
            ConnectionState::Connected => "Connected",
            ConnectionState::DisconnectingUserInitiated => "DisconnectingUserInitiated",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::WaitingForNetwork => "WaitingForNetwork",
            ConnectionState::AutoDisconnected => "AutoDisconnected",
            ConnectionState::ErrorDuringConnection => "ErrorDuringConnection",
            ConnectionState::ReconnectionTimeExceeded => "ReconnectionTimeExceeded",
            ConnectionState::SleepPendingReconnect => "SleepPendingReconnect",
            ConnectionState::WakeReconnecting => "WakeReconnecting",
        }
    }

    /// States in which an attempt is being sequenced.
    pub fn is_attempting(&self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectingUserInitiated
                | ConnectionState::Reconnecting
                | ConnectionState::WakeReconnecting
        )
    }

    /// States that are already winding the connector down.
    pub fn is_winding_down(&self) -> bool {
        matches!(
            self,
            ConnectionState::DisconnectingUserInitiated
                | ConnectionState::ReconnectionTimeExceeded
                | ConnectionState::AutoDisconnected
                | ConnectionState::ErrorDuringConnection
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Single source of truth for the machine, owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorState {
    pub state: ConnectionState,
    /// Server IP of the last attempt that reached `Connected`
    pub last_ip: Option<IpAddr>,
    pub last_protocol: Option<Protocol>,
    /// A verified connection happened since the user's click
    pub had_success: bool,
    /// First error/reconnecting signal of the attempt was handled
    pub error_latch: bool,
    /// Reset the adapter before the next reconnect
    pub adapter_reset_pending: bool,
    pub last_online: bool,
    pub last_interface: Option<String>,
    /// Adapter of the last session that got far enough to open one
    pub last_adapter: Option<String>,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_ip: None,
            last_protocol: None,
            had_success: false,
            error_latch: false,
            adapter_reset_pending: false,
            last_online: true,
            last_interface: None,
            last_adapter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_groups() {
        assert!(ConnectionState::WakeReconnecting.is_attempting());
        assert!(!ConnectionState::Connected.is_attempting());
        assert!(ConnectionState::AutoDisconnected.is_winding_down());
        assert!(!ConnectionState::Reconnecting.is_winding_down());
    }

    #[test]
    fn test_initial_state() {
        let st = OrchestratorState::default();
        assert_eq!(st.state, ConnectionState::Disconnected);
        assert!(st.last_online);
        assert_eq!(st.state.to_string(), "Disconnected");
    }
}
