//! Connection descriptors
//!
//! A [`ConnectionDescriptor`] is the immutable snapshot one attempt runs
//! against. It is built fresh from the current candidate when the attempt
//! starts and is never touched afterwards; failing over means building a
//! new one.

use crate::candidate::{Candidate, CandidateSource, Credentials};
use crate::event::Generation;
use crate::protocol::Protocol;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Candidate source, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    DefaultLocation,
    StaticIp,
    CustomConfig,
}

/// Upstream proxy the tunnel has to traverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Socks,
}

/// Account credentials per connector family, supplied at connect time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCredentials {
    pub direct: Credentials,
    pub os_managed: Credentials,
}

impl ServerCredentials {
    pub fn for_protocol(&self, protocol: Protocol) -> &Credentials {
        match protocol.connector_kind() {
            crate::connector::ConnectorKind::Direct => &self.direct,
            crate::connector::ConnectorKind::OsManaged => &self.os_managed,
        }
    }
}

/// Inputs for [`ConnectionDescriptor::for_attempt`] that come from the
/// session rather than the candidate.
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext<'a> {
    pub generation: Generation,
    pub server_credentials: &'a ServerCredentials,
    /// Answer to a credential prompt for custom configs
    pub custom_credentials: Option<&'a Credentials>,
    pub wrapper_port: Option<u16>,
    pub proxy: Option<&'a ProxySettings>,
    pub mss: Option<u16>,
}

/// Immutable per-attempt snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDescriptor {
    pub generation: Generation,
    pub hostname: String,
    pub ip: IpAddr,
    pub dns_name: Option<String>,
    pub protocol: Protocol,
    pub port: u16,
    /// Local port of the obfuscation wrapper, if the protocol needs one
    pub wrapper_port: Option<u16>,
    pub source: SourceKind,
    pub custom_config: Option<PathBuf>,
    pub credentials: Credentials,
    pub proxy: Option<ProxySettings>,
    pub mss: Option<u16>,
}

impl ConnectionDescriptor {
    pub fn for_attempt(candidate: &Candidate, ctx: AttemptContext<'_>) -> Self {
        let (source, custom_config, credentials) = match &candidate.source {
            CandidateSource::DefaultLocation => (
                SourceKind::DefaultLocation,
                None,
                ctx.server_credentials.for_protocol(candidate.protocol).clone(),
            ),
            CandidateSource::StaticIp { credentials } => {
                (SourceKind::StaticIp, None, credentials.clone())
            }
            CandidateSource::CustomConfig { path } => (
                SourceKind::CustomConfig,
                Some(path.clone()),
                ctx.custom_credentials.cloned().unwrap_or_default(),
            ),
        };

        Self {
            generation: ctx.generation,
            hostname: candidate.hostname.clone(),
            ip: candidate.ip,
            dns_name: candidate.dns_name.clone(),
            protocol: candidate.protocol,
            port: candidate.port,
            wrapper_port: candidate.protocol.wrapper().and(ctx.wrapper_port),
            source,
            custom_config,
            credentials,
            proxy: ctx.proxy.cloned(),
            mss: ctx.mss,
        }
    }

    /// Context string for credential prompts.
    pub fn prompt_context(&self) -> String {
        match &self.custom_config {
            Some(path) => path.display().to_string(),
            None => self.hostname.clone(),
        }
    }

    /// Address the connector dials: the local wrapper when one is in front.
    pub fn dial_target(&self) -> (String, u16) {
        match self.wrapper_port {
            Some(port) => ("127.0.0.1".to_string(), port),
            None => (self.ip.to_string(), self.port),
        }
    }
}
