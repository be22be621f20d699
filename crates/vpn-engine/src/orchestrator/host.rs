//! Orchestrator thread with panic isolation.

use super::{ConnectRequest, ConnectionOrchestrator};
use crate::error::EngineError;
use crate::event::{Command, EngineEvent, Event, PowerEvent};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info};

/// Run the orchestrator on its own thread.
///
/// The thread blocks on the inbox, waking up early when the reconnection
/// timer is due. It exits after a shutdown command.
pub fn spawn_orchestrator(
    orchestrator: ConnectionOrchestrator,
) -> Result<OrchestratorHandle, EngineError> {
    let tx = orchestrator.sender();
    let events = orchestrator.events();

    let thread = thread::Builder::new()
        .name("vpn-orchestrator".to_string())
        .spawn(move || {
            info!("Orchestrator started");
            run_loop(orchestrator);
            info!("Orchestrator stopped");
        })
        .map_err(|e| EngineError::Spawn(e.to_string()))?;

    Ok(OrchestratorHandle {
        tx,
        events,
        thread: Some(thread),
    })
}

fn run_loop(mut orchestrator: ConnectionOrchestrator) {
    loop {
        let received = match orchestrator.reconnection_deadline() {
            Some(deadline) => orchestrator.inbox.recv_deadline(deadline),
            None => orchestrator
                .inbox
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        let event = match received {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                match orchestrator.due_timer_event(Instant::now()) {
                    Some(event) => event,
                    None => continue,
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Inbox closed, shutting down");
                break;
            }
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| orchestrator.handle(event)));
        match result {
            Ok(true) => {}
            Ok(false) => break,
            Err(panic_info) => {
                let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!(
                    "Orchestrator panicked in {}: {}",
                    orchestrator.state(),
                    message
                );
            }
        }
    }
}

/// Handle to a hosted orchestrator. Dropping it shuts the thread down.
pub struct OrchestratorHandle {
    tx: Sender<Event>,
    events: Receiver<EngineEvent>,
    thread: Option<thread::JoinHandle<()>>,
}

impl OrchestratorHandle {
    /// Start a session; waits for the orchestrator to accept or reject it.
    pub fn connect(&self, request: ConnectRequest) -> Result<(), EngineError> {
        let (reply, result) = bounded(1);
        self.command(Command::Connect {
            request: Box::new(request),
            reply,
        })?;
        result.recv().map_err(|_| EngineError::Stopped)?
    }

    pub fn disconnect(&self) -> Result<(), EngineError> {
        self.command(Command::Disconnect)
    }

    pub fn continue_with_credentials(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
        reconnect_needed: bool,
    ) -> Result<(), EngineError> {
        self.command(Command::ContinueWithCredentials {
            username: username.into(),
            password: password.into(),
            reconnect_needed,
        })
    }

    pub fn continue_with_password(&self, password: impl Into<String>) -> Result<(), EngineError> {
        self.command(Command::ContinueWithPassword {
            password: password.into(),
        })
    }

    pub fn reset_candidates(&self) -> Result<(), EngineError> {
        self.command(Command::ResetCandidates)
    }

    pub fn set_mss(&self, mss: Option<u16>) -> Result<(), EngineError> {
        self.command(Command::SetMss(mss))
    }

    /// Forward a connectivity notification from the platform.
    pub fn network_changed(
        &self,
        online: bool,
        interface: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.send(Event::Network {
            online,
            interface: interface.into(),
        })
    }

    pub fn power(&self, event: PowerEvent) -> Result<(), EngineError> {
        self.send(Event::Power(event))
    }

    pub fn events(&self) -> &Receiver<EngineEvent> {
        &self.events
    }

    /// Blocking disconnect, then join the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn command(&self, command: Command) -> Result<(), EngineError> {
        self.send(Event::Command(command))
    }

    fn send(&self, event: Event) -> Result<(), EngineError> {
        self.tx.send(event).map_err(|_| EngineError::Stopped)
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.tx.send(Event::Command(Command::Shutdown));
        if thread.join().is_err() {
            error!("Orchestrator thread terminated abnormally");
        }
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
