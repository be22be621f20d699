//! Protocol connectors
//!
//! A connector drives one tunnel attempt for one family of protocols and
//! reports progress through the [`EventSink`] it was started with. The
//! orchestrator owns at most one connector instance and recreates it when
//! the next attempt needs a different family.

pub mod direct;
pub mod os_managed;

pub use direct::DirectTunnelConnector;
pub use os_managed::{OsManagedConnector, OsTunnelService, OsTunnelStatus};

use crate::config::DirectConfig;
use crate::descriptor::ConnectionDescriptor;
use crate::event::EventSink;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Connector family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    /// Tunnel helper process driven over its management socket
    Direct,
    /// Tunnel owned by the operating system
    OsManaged,
}

pub trait Connector: Send {
    fn kind(&self) -> ConnectorKind;

    /// Begin an attempt. Returns immediately; progress arrives as events.
    fn start(&mut self, descriptor: Arc<ConnectionDescriptor>, events: EventSink);

    /// Request teardown. Idempotent; completion is the `Disconnected` signal.
    fn stop(&mut self);

    fn is_disconnected(&self) -> bool;

    fn adapter_name(&self) -> Option<String>;

    fn continue_with_credentials(&mut self, username: &str, password: &str);

    fn continue_with_password(&mut self, password: &str);
}

pub trait ConnectorFactory: Send {
    fn create(&mut self, kind: ConnectorKind) -> Box<dyn Connector>;
}

/// Builds the bundled connectors on a shared tokio runtime.
pub struct DefaultConnectorFactory {
    runtime: Handle,
    direct: DirectConfig,
    os_service: Arc<dyn OsTunnelService>,
}

impl DefaultConnectorFactory {
    pub fn new(runtime: Handle, direct: DirectConfig, os_service: Arc<dyn OsTunnelService>) -> Self {
        Self {
            runtime,
            direct,
            os_service,
        }
    }
}

impl ConnectorFactory for DefaultConnectorFactory {
    fn create(&mut self, kind: ConnectorKind) -> Box<dyn Connector> {
        match kind {
            ConnectorKind::Direct => Box::new(DirectTunnelConnector::new(
                self.runtime.clone(),
                self.direct.clone(),
            )),
            ConnectorKind::OsManaged => Box::new(OsManagedConnector::new(
                self.runtime.clone(),
                self.os_service.clone(),
            )),
        }
    }
}
