//! Candidate Selection Policy
//!
//! Turns a location plus the user's connection settings into an ordered
//! list of (server, protocol, port) candidates and walks that list as
//! attempts fail.
//!
//! # Order
//!
//! Candidates are consumed strictly in the order supplied: nodes in
//! location order, and for each node the protocols in port-map order.
//! Manual mode always holds exactly one candidate and never reports
//! exhaustion; the reconnection budget bounds it instead.

use crate::error::EngineError;
use crate::protocol::Protocol;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{debug, info};

/// Automatic failover or a single user-chosen candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Automatic,
    Manual,
}

impl ConnectionMode {
    pub fn is_automatic(&self) -> bool {
        matches!(self, ConnectionMode::Automatic)
    }
}

/// Username/password pair for one attempt.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where a candidate came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CandidateSource {
    /// Regular location; credentials come from the session
    DefaultLocation,
    /// Dedicated static IP with its own credentials
    StaticIp { credentials: Credentials },
    /// User-supplied tunnel configuration file
    CustomConfig { path: PathBuf },
}

/// One (server, protocol, port) tuple eligible for an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub hostname: String,
    pub ip: IpAddr,
    /// Remote identity for protocols that authenticate by name
    #[serde(default)]
    pub dns_name: Option<String>,
    pub protocol: Protocol,
    pub port: u16,
    pub source: CandidateSource,
}

/// A server inside a location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerNode {
    pub hostname: String,
    pub ip: IpAddr,
    #[serde(default)]
    pub dns_name: Option<String>,
    /// Per-node credentials (static IP locations)
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

/// Location kind as selected in the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LocationKind {
    Default,
    StaticIp,
    CustomConfig { path: PathBuf },
}

/// A location with its ordered node list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub kind: LocationKind,
    pub nodes: Vec<ServerNode>,
}

/// User's protocol/port choice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub mode: ConnectionMode,
    pub protocol: Protocol,
    pub port: u16,
}

/// Ports offered per protocol, in preference order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortMap {
    pub entries: Vec<PortMapEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapEntry {
    pub protocol: Protocol,
    pub ports: Vec<u16>,
}

impl PortMap {
    pub fn new(entries: Vec<PortMapEntry>) -> Self {
        Self { entries }
    }

    pub fn ports_for(&self, protocol: Protocol) -> &[u16] {
        self.entries
            .iter()
            .find(|e| e.protocol == protocol)
            .map(|e| e.ports.as_slice())
            .unwrap_or(&[])
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    HasMore,
    Exhausted,
}

/// Ordered candidates with a cursor and a consecutive-failure counter.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    /// As supplied at construction, for `reset`
    original: Vec<Candidate>,
    candidates: Vec<Candidate>,
    cursor: usize,
    failure_streak: u32,
    threshold: u32,
    mode: ConnectionMode,
    last_success: Option<usize>,
}

impl CandidateSet {
    /// Create from a caller-ranked list.
    pub fn new(
        mut candidates: Vec<Candidate>,
        mode: ConnectionMode,
        threshold: u32,
    ) -> Result<Self, EngineError> {
        if candidates.is_empty() {
            return Err(EngineError::NoCandidates);
        }
        if mode == ConnectionMode::Manual {
            candidates.truncate(1);
        }

        Ok(Self {
            original: candidates.clone(),
            candidates,
            cursor: 0,
            failure_streak: 0,
            threshold: threshold.max(1),
            mode,
            last_success: None,
        })
    }

    /// Build from a location, the connection settings and the port map.
    pub fn build(
        location: &Location,
        settings: &ConnectionSettings,
        port_map: &PortMap,
        proxy_enabled: bool,
        threshold: u32,
    ) -> Result<Self, EngineError> {
        let candidates = match &location.kind {
            LocationKind::CustomConfig { path } => {
                let (hostname, ip) = match location.nodes.first() {
                    Some(node) => (node.hostname.clone(), node.ip),
                    None => return Err(EngineError::NoCandidates),
                };
                vec![Candidate {
                    hostname,
                    ip,
                    dns_name: None,
                    protocol: Protocol::DirectUdp,
                    port: 0,
                    source: CandidateSource::CustomConfig { path: path.clone() },
                }]
            }
            LocationKind::Default | LocationKind::StaticIp => {
                let source_for = |node: &ServerNode| match location.kind {
                    LocationKind::StaticIp => CandidateSource::StaticIp {
                        credentials: node.credentials.clone().unwrap_or_default(),
                    },
                    _ => CandidateSource::DefaultLocation,
                };

                match settings.mode {
                    ConnectionMode::Manual => location
                        .nodes
                        .first()
                        .map(|node| Candidate {
                            hostname: node.hostname.clone(),
                            ip: node.ip,
                            dns_name: node.dns_name.clone(),
                            protocol: settings.protocol,
                            port: settings.port,
                            source: source_for(node),
                        })
                        .into_iter()
                        .collect(),
                    ConnectionMode::Automatic => {
                        let mut out = Vec::new();
                        for node in &location.nodes {
                            for entry in &port_map.entries {
                                if proxy_enabled && entry.protocol.is_udp() {
                                    continue;
                                }
                                if let Some(&port) = entry.ports.first() {
                                    out.push(Candidate {
                                        hostname: node.hostname.clone(),
                                        ip: node.ip,
                                        dns_name: node.dns_name.clone(),
                                        protocol: entry.protocol,
                                        port,
                                        source: source_for(node),
                                    });
                                }
                            }
                        }
                        out
                    }
                }
            }
        };

        let set = Self::new(candidates, settings.mode, threshold)?;
        info!(
            "Candidates for {} ({:?}, {} entries, threshold {})",
            location.name,
            set.mode,
            set.candidates.len(),
            set.threshold
        );
        Ok(set)
    }

    pub fn current(&self) -> &Candidate {
        &self.candidates[self.cursor]
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn is_automatic(&self) -> bool {
        self.mode.is_automatic()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn failure_streak(&self) -> u32 {
        self.failure_streak
    }

    pub fn last_successful(&self) -> Option<&Candidate> {
        self.last_success.map(|i| &self.candidates[i])
    }

    /// Record a failed attempt on the current candidate and advance.
    pub fn record_failure(&mut self) -> FailureOutcome {
        self.failure_streak = self.failure_streak.saturating_add(1);

        if self.mode == ConnectionMode::Manual {
            debug!("Manual candidate failed ({} in a row)", self.failure_streak);
            return FailureOutcome::HasMore;
        }

        self.cursor = (self.cursor + 1) % self.candidates.len();
        debug!(
            "Candidate failed, streak {}/{}, next {}",
            self.failure_streak, self.threshold, self.cursor
        );

        if self.failure_streak >= self.threshold {
            FailureOutcome::Exhausted
        } else {
            FailureOutcome::HasMore
        }
    }

    /// Confirmed success: clears the streak, keeps the cursor.
    pub fn record_success(&mut self) {
        self.failure_streak = 0;
        self.last_success = Some(self.cursor);
    }

    /// Rebuild from the originally supplied list.
    pub fn reset(&mut self) {
        self.candidates = self.original.clone();
        self.cursor = 0;
        self.failure_streak = 0;
        self.last_success = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn node(n: u8) -> ServerNode {
        ServerNode {
            hostname: format!("node{n}.example.net"),
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)),
            dns_name: None,
            credentials: None,
        }
    }

    fn location(kind: LocationKind, nodes: usize) -> Location {
        Location {
            name: "Frankfurt".into(),
            kind,
            nodes: (1..=nodes as u8).map(node).collect(),
        }
    }

    fn port_map() -> PortMap {
        PortMap::new(vec![
            PortMapEntry { protocol: Protocol::DirectUdp, ports: vec![443, 1194] },
            PortMapEntry { protocol: Protocol::DirectTcp, ports: vec![443] },
            PortMapEntry { protocol: Protocol::TlsWrapped, ports: vec![8443] },
        ])
    }

    fn automatic() -> ConnectionSettings {
        ConnectionSettings { mode: ConnectionMode::Automatic, protocol: Protocol::DirectUdp, port: 443 }
    }

    #[test]
    fn test_automatic_order_is_node_then_port_map() {
        let set = CandidateSet::build(&location(LocationKind::Default, 2), &automatic(), &port_map(), false, 3).unwrap();

        assert_eq!(set.len(), 6);
        let order: Vec<_> = set.candidates.iter().map(|c| (c.hostname.as_str(), c.protocol, c.port)).collect();
        assert_eq!(order[0], ("node1.example.net", Protocol::DirectUdp, 443));
        assert_eq!(order[1], ("node1.example.net", Protocol::DirectTcp, 443));
        assert_eq!(order[2], ("node1.example.net", Protocol::TlsWrapped, 8443));
        assert_eq!(order[3].0, "node2.example.net");
    }

    #[test]
    fn test_proxy_skips_udp() {
        let set = CandidateSet::build(&location(LocationKind::Default, 1), &automatic(), &port_map(), true, 3).unwrap();

        assert_eq!(set.len(), 2);
        assert!(set.candidates.iter().all(|c| !c.protocol.is_udp()));
    }

    #[test]
    fn test_manual_has_exactly_one_candidate() {
        let settings = ConnectionSettings { mode: ConnectionMode::Manual, protocol: Protocol::DirectTcp, port: 80 };
        let mut set = CandidateSet::build(&location(LocationKind::Default, 3), &settings, &port_map(), false, 1).unwrap();

        assert_eq!(set.len(), 1);
        assert_eq!(set.current().port, 80);
        for _ in 0..10 {
            assert_eq!(set.record_failure(), FailureOutcome::HasMore);
        }
        assert_eq!(set.cursor(), 0);
    }

    #[test]
    fn test_static_ip_carries_node_credentials() {
        let mut loc = location(LocationKind::StaticIp, 1);
        loc.nodes[0].credentials = Some(Credentials::new("static", "secret"));
        let set = CandidateSet::build(&loc, &automatic(), &port_map(), false, 3).unwrap();

        match &set.current().source {
            CandidateSource::StaticIp { credentials } => assert_eq!(credentials.username, "static"),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_custom_config_single_candidate() {
        let loc = location(LocationKind::CustomConfig { path: "/tmp/office.conf".into() }, 1);
        let set = CandidateSet::build(&loc, &automatic(), &port_map(), false, 3).unwrap();

        assert_eq!(set.len(), 1);
        assert!(matches!(set.current().source, CandidateSource::CustomConfig { .. }));
    }

    #[test]
    fn test_exhaustion_after_threshold() {
        let mut set = CandidateSet::build(&location(LocationKind::Default, 1), &automatic(), &port_map(), false, 3).unwrap();

        assert_eq!(set.record_failure(), FailureOutcome::HasMore);
        assert_eq!(set.current().protocol, Protocol::DirectTcp);
        assert_eq!(set.record_failure(), FailureOutcome::HasMore);
        assert_eq!(set.current().protocol, Protocol::TlsWrapped);
        assert_eq!(set.record_failure(), FailureOutcome::Exhausted);
    }

    #[test]
    fn test_success_resets_streak_not_cursor() {
        let mut set = CandidateSet::build(&location(LocationKind::Default, 1), &automatic(), &port_map(), false, 3).unwrap();

        set.record_failure();
        set.record_failure();
        set.record_success();

        assert_eq!(set.failure_streak(), 0);
        assert_eq!(set.cursor(), 2);
        assert_eq!(set.last_successful().unwrap().protocol, Protocol::TlsWrapped);
        assert_eq!(set.record_failure(), FailureOutcome::HasMore);

        set.reset();
        assert_eq!(set.cursor(), 0);
        assert_eq!(set.failure_streak(), 0);
    }

    #[test]
    fn test_empty_location_rejected() {
        let result = CandidateSet::build(&location(LocationKind::Default, 0), &automatic(), &port_map(), false, 3);
        assert!(matches!(result, Err(EngineError::NoCandidates)));
    }
}
