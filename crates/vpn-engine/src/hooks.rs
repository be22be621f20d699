//! Connection hooks
//!
//! Firewall / kill-switch style integrations that must track whether the
//! tunnel is up. The orchestrator calls [`ConnectionHooks::on_entered_connected`]
//! when an attempt reaches `Connected` and [`ConnectionHooks::on_left_connected`]
//! once when that attempt is torn down.
//!
//! [`KillSwitch`] is the built-in hook: a "soft" kill switch that the
//! application consults before letting traffic out while the tunnel is down.
//! It does not touch routing tables.

use crate::descriptor::ConnectionDescriptor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

pub trait ConnectionHooks: Send {
    fn on_entered_connected(&mut self, descriptor: &ConnectionDescriptor);
    fn on_left_connected(&mut self);
}

/// Kill switch state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchState {
    Disabled,
    /// Enabled and tunnel up (traffic allowed)
    Enabled,
    /// Tunnel down, traffic blocked
    Active,
}

impl KillSwitchState {
    pub fn allows_traffic(&self) -> bool {
        matches!(self, KillSwitchState::Disabled | KillSwitchState::Enabled)
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, KillSwitchState::Active)
    }
}

/// Kill switch shared between the orchestrator (as a hook) and the
/// traffic paths that consult it.
///
/// ```rust,ignore
/// let kill_switch = KillSwitch::new(true);
/// collaborators.hooks.push(Box::new(kill_switch.clone()));
///
/// // elsewhere, before sending:
/// if kill_switch.is_blocking() {
///     return Err(TrafficBlocked);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct KillSwitch {
    enabled: bool,
    tunnel_up: Arc<AtomicBool>,
}

impl KillSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            tunnel_up: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn state(&self) -> KillSwitchState {
        if !self.enabled {
            KillSwitchState::Disabled
        } else if self.tunnel_up.load(Ordering::Relaxed) {
            KillSwitchState::Enabled
        } else {
            KillSwitchState::Active
        }
    }

    pub fn allows_traffic(&self) -> bool {
        self.state().allows_traffic()
    }

    pub fn is_blocking(&self) -> bool {
        self.state().is_blocking()
    }
}

impl ConnectionHooks for KillSwitch {
    fn on_entered_connected(&mut self, descriptor: &ConnectionDescriptor) {
        debug!(
            "Kill switch: tunnel up via {} ({}), traffic allowed",
            descriptor.hostname, descriptor.protocol
        );
        self.tunnel_up.store(true, Ordering::Relaxed);
    }

    fn on_left_connected(&mut self) {
        if self.enabled {
            warn!("Kill switch: tunnel down, blocking traffic");
        }
        self.tunnel_up.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Candidate, CandidateSource};
    use crate::descriptor::{AttemptContext, ServerCredentials};
    use crate::event::Generation;
    use crate::protocol::Protocol;

    fn descriptor() -> ConnectionDescriptor {
        let candidate = Candidate {
            hostname: "nl-ams-02.example.net".into(),
            ip: "10.1.2.3".parse().unwrap(),
            dns_name: None,
            protocol: Protocol::DirectUdp,
            port: 1194,
            source: CandidateSource::DefaultLocation,
        };
        let server = ServerCredentials::default();
        ConnectionDescriptor::for_attempt(
            &candidate,
            AttemptContext {
                generation: Generation(1),
                server_credentials: &server,
                custom_credentials: None,
                wrapper_port: None,
                proxy: None,
                mss: None,
            },
        )
    }

    #[test]
    fn test_disabled_never_blocks() {
        let ks = KillSwitch::disabled();
        assert_eq!(ks.state(), KillSwitchState::Disabled);
        assert!(ks.allows_traffic());
    }

    #[test]
    fn test_blocks_until_connected() {
        let ks = KillSwitch::new(true);
        assert_eq!(ks.state(), KillSwitchState::Active);
        assert!(!ks.allows_traffic());

        let mut hook = ks.clone();
        hook.on_entered_connected(&descriptor());
        assert_eq!(ks.state(), KillSwitchState::Enabled);
        assert!(ks.allows_traffic());

        hook.on_left_connected();
        assert!(ks.is_blocking());
    }
}
