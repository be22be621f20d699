//! Obfuscation wrappers
//!
//! Some protocols tunnel through a local helper process that disguises the
//! traffic (TLS or WebSocket framing). The wrapper listens on a local port;
//! the connector dials that port instead of the server.
//!
//! Lifecycle per attempt: `start` → `Ready` (or `Failed`) → optionally
//! `Exited` if the process dies while in use. `stop` kills the process and
//! may be called at any time.

pub mod process;
pub mod tls;
pub mod websocket;

pub use process::{ExitWatch, ProcessExit, TunnelProcessHandle};
pub use tls::{Tls, TlsWrapper};
pub use websocket::{WebSocket, WebSocketWrapper};

use crate::config::{WrapperConfig, WrapperProcessConfig};
use crate::event::{EventSink, WrapperSignal};
use std::marker::PhantomData;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapperKind {
    Tls,
    WebSocket,
}

impl WrapperKind {
    pub fn name(&self) -> &'static str {
        match self {
            WrapperKind::Tls => "tls-wrapper",
            WrapperKind::WebSocket => "websocket-wrapper",
        }
    }
}

impl std::fmt::Display for WrapperKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub trait ObfuscationWrapper: Send {
    fn kind(&self) -> WrapperKind;

    /// Local port the connector should dial.
    fn local_port(&self) -> u16;

    /// Launch towards `remote_host:remote_port`. Kills any previous process.
    fn start(&mut self, remote_host: &str, remote_port: u16, events: EventSink);

    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WrapperError {
    #[error("Failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Local port not accepting after {0:?}")]
    NotReady(Duration),

    #[error("Exited before ready ({0:?})")]
    ExitedEarly(Option<i32>),
}

/// Command line of one wrapper program.
pub trait WrapperFlavor: Send + 'static {
    const KIND: WrapperKind;

    fn process_config(config: &WrapperConfig) -> &WrapperProcessConfig;

    fn args(local_port: u16, remote_host: &str, remote_port: u16) -> Vec<String>;
}

/// Wrapper backed by an external program.
pub struct ProcessWrapper<F: WrapperFlavor> {
    runtime: Handle,
    program: WrapperProcessConfig,
    ready_timeout: Duration,
    ready_poll: Duration,
    process: Option<TunnelProcessHandle>,
    _flavor: PhantomData<F>,
}

impl<F: WrapperFlavor> ProcessWrapper<F> {
    pub fn new(runtime: Handle, config: &WrapperConfig) -> Self {
        Self {
            runtime,
            program: F::process_config(config).clone(),
            ready_timeout: config.ready_timeout(),
            ready_poll: config.ready_poll(),
            process: None,
            _flavor: PhantomData,
        }
    }

    fn command(&self, remote_host: &str, remote_port: u16) -> Command {
        let mut command = Command::new(&self.program.program);
        command
            .args(F::args(self.program.local_port, remote_host, remote_port))
            .args(&self.program.extra_args);
        command
    }
}

impl<F: WrapperFlavor> ObfuscationWrapper for ProcessWrapper<F> {
    fn kind(&self) -> WrapperKind {
        F::KIND
    }

    fn local_port(&self) -> u16 {
        self.program.local_port
    }

    fn start(&mut self, remote_host: &str, remote_port: u16, events: EventSink) {
        self.stop();

        let command = self.command(remote_host, remote_port);
        match TunnelProcessHandle::spawn(&self.runtime, F::KIND.name(), command) {
            Ok((handle, exit)) => {
                info!(
                    "{} forwarding 127.0.0.1:{} -> {}:{} ({})",
                    F::KIND,
                    self.program.local_port,
                    remote_host,
                    remote_port,
                    events.generation()
                );
                self.process = Some(handle);
                self.runtime.spawn(supervise(
                    F::KIND,
                    self.program.local_port,
                    self.ready_timeout,
                    self.ready_poll,
                    exit,
                    events,
                ));
            }
            Err(e) => {
                let err = WrapperError::Spawn {
                    program: self.program.program.clone(),
                    reason: e.to_string(),
                };
                warn!("{}", err);
                events.wrapper(F::KIND, WrapperSignal::Failed(err.to_string()));
            }
        }
    }

    fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.kill();
        }
    }

    fn is_running(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.is_running())
    }
}

async fn supervise(
    kind: WrapperKind,
    port: u16,
    ready_timeout: Duration,
    ready_poll: Duration,
    exit: ExitWatch,
    events: EventSink,
) {
    let mut exit = std::pin::pin!(exit.wait());

    let listening = tokio::select! {
        biased;
        status = &mut exit => Err(status),
        result = wait_until_listening(port, ready_timeout, ready_poll) => Ok(result),
    };
    let ready = match listening {
        // The listener may belong to another process; ours has to outlive a poll
        Ok(Ok(())) => tokio::select! {
            biased;
            status = &mut exit => Err(status),
            _ = tokio::time::sleep(ready_poll) => Ok(Ok(())),
        },
        other => other,
    };

    match ready {
        Ok(Ok(())) => {
            debug!("{} ready on port {}", kind, port);
            events.wrapper(kind, WrapperSignal::Ready);
        }
        Ok(Err(e)) => {
            warn!("{} failed: {}", kind, e);
            events.wrapper(kind, WrapperSignal::Failed(e.to_string()));
            return;
        }
        Err(ProcessExit::Exited(code)) => {
            let e = WrapperError::ExitedEarly(code);
            warn!("{} failed: {}", kind, e);
            events.wrapper(kind, WrapperSignal::Failed(e.to_string()));
            return;
        }
        // Stopped by the owner
        Err(ProcessExit::Killed) => return,
    }

    if let ProcessExit::Exited(code) = exit.await {
        warn!("{} exited while in use ({:?})", kind, code);
        events.wrapper(kind, WrapperSignal::Exited);
    }
}

/// Poll until something accepts on `127.0.0.1:port`.
pub async fn wait_until_listening(
    port: u16,
    timeout: Duration,
    poll: Duration,
) -> Result<(), WrapperError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(WrapperError::NotReady(timeout));
        }
        tokio::time::sleep(poll).await;
    }
}
