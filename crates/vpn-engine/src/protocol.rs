//! Transport protocol tags
//!
//! A protocol tag decides two things for an attempt: which connector
//! family establishes the tunnel, and whether an obfuscation wrapper has to
//! be listening before the connector may dial it.

use crate::connector::ConnectorKind;
use crate::wrapper::WrapperKind;
use serde::{Deserialize, Serialize};

/// Transport protocol of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Direct tunnel over UDP
    DirectUdp,
    /// Direct tunnel over TCP
    DirectTcp,
    /// OS-managed IPsec/IKEv2 tunnel
    Ikev2,
    /// Direct tunnel carried inside a local TLS wrapper
    TlsWrapped,
    /// Direct tunnel carried inside a local WebSocket wrapper
    WebSocketWrapped,
}

impl Protocol {
    pub fn all() -> &'static [Protocol] {
        &[
            Protocol::DirectUdp,
            Protocol::DirectTcp,
            Protocol::Ikev2,
            Protocol::TlsWrapped,
            Protocol::WebSocketWrapped,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::DirectUdp => "udp",
            Protocol::DirectTcp => "tcp",
            Protocol::Ikev2 => "ikev2",
            Protocol::TlsWrapped => "tls",
            Protocol::WebSocketWrapped => "wss",
        }
    }

    /// Connector family that establishes this protocol.
    pub fn connector_kind(&self) -> ConnectorKind {
        match self {
            Protocol::Ikev2 => ConnectorKind::OsManaged,
            _ => ConnectorKind::Direct,
        }
    }

    /// Wrapper that must be ready before the connector starts.
    pub fn wrapper(&self) -> Option<WrapperKind> {
        match self {
            Protocol::TlsWrapped => Some(WrapperKind::Tls),
            Protocol::WebSocketWrapped => Some(WrapperKind::WebSocket),
            _ => None,
        }
    }

    /// UDP transports cannot be carried through an upstream proxy.
    pub fn is_udp(&self) -> bool {
        matches!(self, Protocol::DirectUdp | Protocol::Ikev2)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::all()
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown protocol: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_protocols_use_direct_connector() {
        assert_eq!(Protocol::TlsWrapped.connector_kind(), ConnectorKind::Direct);
        assert_eq!(Protocol::TlsWrapped.wrapper(), Some(WrapperKind::Tls));
        assert_eq!(Protocol::WebSocketWrapped.wrapper(), Some(WrapperKind::WebSocket));
        assert_eq!(Protocol::DirectUdp.wrapper(), None);
        assert_eq!(Protocol::Ikev2.connector_kind(), ConnectorKind::OsManaged);
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("WSS".parse::<Protocol>().unwrap(), Protocol::WebSocketWrapped);
        assert_eq!("ikev2".parse::<Protocol>().unwrap(), Protocol::Ikev2);
        assert!("l2tp".parse::<Protocol>().is_err());
    }
}
