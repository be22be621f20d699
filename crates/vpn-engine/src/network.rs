//! Network-state collaborator

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Read side of the platform network monitor.
///
/// Changes are delivered to the orchestrator as `Event::Network`; this is
/// only consulted when an attempt is about to start.
pub trait NetworkState: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Online flag shared between a platform monitor and the orchestrator.
#[derive(Debug, Clone)]
pub struct SharedNetworkState {
    online: Arc<AtomicBool>,
}

impl SharedNetworkState {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

impl Default for SharedNetworkState {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkState for SharedNetworkState {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }
}
