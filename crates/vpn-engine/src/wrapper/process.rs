//! Supervised external processes
//!
//! Wrapper programs and the direct tunnel helper run as child processes on
//! the tokio runtime. A [`TunnelProcessHandle`] is the owner's kill switch
//! for one of them; the paired [`ExitWatch`] resolves when the process is
//! gone, whether it exited or was killed.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Killed through its handle
    Killed,
    /// Exited on its own with this code (None if signalled)
    Exited(Option<i32>),
}

/// Resolves once the process has ended.
#[derive(Debug)]
pub struct ExitWatch {
    rx: oneshot::Receiver<ProcessExit>,
}

impl ExitWatch {
    pub async fn wait(self) -> ProcessExit {
        // Supervisor dropped with the runtime; the child went with it
        self.rx.await.unwrap_or(ProcessExit::Killed)
    }
}

/// Owner handle of one external process.
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct TunnelProcessHandle {
    name: String,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    running: Arc<AtomicBool>,
}

impl TunnelProcessHandle {
    /// Spawn `command` and start supervising it on `runtime`.
    pub fn spawn(
        runtime: &Handle,
        name: impl Into<String>,
        mut command: Command,
    ) -> std::io::Result<(Self, ExitWatch)> {
        let name = name.into();
        command
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = {
            let _guard = runtime.enter();
            command.spawn()?
        };
        let pid = child.id();
        info!("Started {} (pid {:?})", name, pid);

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let running = Arc::new(AtomicBool::new(true));

        let flag = running.clone();
        let label = name.clone();
        runtime.spawn(async move {
            // A dropped sender counts as a kill request
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };

            let exit = match status {
                Some(status) => ProcessExit::Exited(status.ok().and_then(|s| s.code())),
                None => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill {}: {}", label, e);
                    }
                    ProcessExit::Killed
                }
            };

            flag.store(false, Ordering::Relaxed);
            debug!("{} finished: {:?}", label, exit);
            let _ = exit_tx.send(exit);
        });

        Ok((
            Self {
                name,
                pid,
                kill_tx: Some(kill_tx),
                running,
            },
            ExitWatch { rx: exit_rx },
        ))
    }

    /// Kill the process. Safe to call any number of times.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            debug!("Killing {} (pid {:?})", self.name, self.pid);
            let _ = tx.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TunnelProcessHandle {
    fn drop(&mut self) {
        self.kill();
    }
}
