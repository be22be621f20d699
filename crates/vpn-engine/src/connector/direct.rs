//! Direct tunnel connector
//!
//! Spawns the tunnel helper process and drives it over its local
//! management socket. Management lines map onto connector signals:
//!
//! - `>STATE:..,CONNECTED,SUCCESS` → `Connected`
//! - `>STATE:..,CONNECTED,ERROR` → `Error(ConnectedWithErrors)`
//! - `>STATE:..,RECONNECTING` → `Reconnecting`
//! - `>BYTECOUNT:in,out` → cumulative `Statistics`
//! - `>PASSWORD:Need 'Auth' ...` → answered from the descriptor, or `RequestUsername`
//! - `>PASSWORD:Need 'Private Key' ...` → `RequestPassword`
//! - `>PASSWORD:Verification Failed` → `Error(AuthenticationRequired)`
//! - `>FATAL:` → device errors or `ConnectedError`
//! - `>LOG:` → adapter name and transport errors

use super::{Connector, ConnectorKind};
use crate::config::DirectConfig;
use crate::descriptor::{ConnectionDescriptor, ProxyKind};
use crate::error::ConnectionError;
use crate::event::{ConnectorSignal, EventSink};
use crate::wrapper::{ExitWatch, ProcessExit, TunnelProcessHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const MANAGEMENT_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum Control {
    Stop,
    Credentials { username: String, password: String },
    Password(String),
}

/// State one session shares with the connector object.
#[derive(Debug)]
struct LinkState {
    disconnected: AtomicBool,
    adapter: Mutex<Option<String>>,
}

impl LinkState {
    fn new(disconnected: bool) -> Self {
        Self {
            disconnected: AtomicBool::new(disconnected),
            adapter: Mutex::new(None),
        }
    }

    fn set_adapter(&self, adapter: Option<String>) {
        if let Ok(mut slot) = self.adapter.lock() {
            *slot = adapter;
        }
    }

    fn adapter(&self) -> Option<String> {
        self.adapter.lock().ok().and_then(|slot| slot.clone())
    }
}

pub struct DirectTunnelConnector {
    runtime: Handle,
    config: DirectConfig,
    control: Option<mpsc::UnboundedSender<Control>>,
    link: Arc<LinkState>,
}

impl DirectTunnelConnector {
    pub fn new(runtime: Handle, config: DirectConfig) -> Self {
        Self {
            runtime,
            config,
            control: None,
            link: Arc::new(LinkState::new(true)),
        }
    }

    fn send_control(&self, control: Control) {
        match &self.control {
            Some(tx) => {
                let _ = tx.send(control);
            }
            None => debug!("No helper session, dropping prompt answer"),
        }
    }
}

impl Connector for DirectTunnelConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Direct
    }

    fn start(&mut self, descriptor: Arc<ConnectionDescriptor>, events: EventSink) {
        self.stop();

        // Fresh link per session so a lingering one cannot flip our flags
        self.link = Arc::new(LinkState::new(false));

        let mut command = Command::new(&self.config.program);
        command.args(helper_args(&self.config, &descriptor));

        match TunnelProcessHandle::spawn(&self.runtime, "tunnel helper", command) {
            Ok((process, exit)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.control = Some(tx);

                let session = Session {
                    config: self.config.clone(),
                    descriptor,
                    events,
                    link: self.link.clone(),
                    process,
                };
                self.runtime.spawn(session.run(rx, exit));
            }
            Err(e) => {
                error!("Can't run tunnel helper {}: {}", self.config.program, e);
                self.link.disconnected.store(true, Ordering::Relaxed);
                events.connector(ConnectorSignal::Error(ConnectionError::CantRunHelper(
                    e.to_string(),
                )));
                events.connector(ConnectorSignal::Disconnected);
            }
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.control.take() {
            let _ = tx.send(Control::Stop);
        }
    }

    fn is_disconnected(&self) -> bool {
        self.link.disconnected.load(Ordering::Relaxed)
    }

    fn adapter_name(&self) -> Option<String> {
        self.link.adapter()
    }

    fn continue_with_credentials(&mut self, username: &str, password: &str) {
        self.send_control(Control::Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    fn continue_with_password(&mut self, password: &str) {
        self.send_control(Control::Password(password.to_string()));
    }
}

impl Drop for DirectTunnelConnector {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Opened {
    Socket(Option<TcpStream>),
    HelperExited(ProcessExit),
    StopRequested,
}

enum Step {
    Line(Option<String>),
    Control(Option<Control>),
    Exited(ProcessExit),
}

/// One helper process from spawn to exit.
struct Session {
    config: DirectConfig,
    descriptor: Arc<ConnectionDescriptor>,
    events: EventSink,
    link: Arc<LinkState>,
    process: TunnelProcessHandle,
}

impl Session {
    async fn run(mut self, mut control: mpsc::UnboundedReceiver<Control>, exit: ExitWatch) {
        let mut exit = std::pin::pin!(exit.wait());
        let port = self.config.management_port;

        let opened = tokio::select! {
            stream = connect_management(port, self.config.start_timeout()) => Opened::Socket(stream),
            status = &mut exit => Opened::HelperExited(status),
            _ = wait_for_stop(&mut control) => Opened::StopRequested,
        };

        let stream = match opened {
            Opened::Socket(Some(stream)) => stream,
            Opened::Socket(None) => {
                error!("Tunnel helper management socket not reachable on port {}", port);
                self.events
                    .connector(ConnectorSignal::Error(ConnectionError::NoHelperSocket));
                self.process.kill();
                exit.await;
                self.finish();
                return;
            }
            Opened::HelperExited(status) => {
                warn!("Tunnel helper exited during startup ({:?})", status);
                self.events
                    .connector(ConnectorSignal::Error(ConnectionError::CantRunHelper(format!(
                        "exited during startup ({status:?})"
                    ))));
                self.finish();
                return;
            }
            Opened::StopRequested => {
                self.process.kill();
                exit.await;
                self.finish();
                return;
            }
        };

        debug!("Attached to management socket on port {} ({})", port, self.events.generation());
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        send(&mut writer, "state on\nbytecount 1\nhold release\n").await;

        let mut stopping = false;
        let mut exited = None;
        loop {
            let step = tokio::select! {
                line = lines.next_line() => Step::Line(line.ok().flatten()),
                ctl = control.recv(), if !stopping => Step::Control(ctl),
                status = &mut exit => Step::Exited(status),
            };

            match step {
                Step::Line(Some(line)) => self.on_line(&line, &mut writer).await,
                Step::Line(None) => {
                    debug!("Management socket closed");
                    break;
                }
                Step::Control(Some(Control::Credentials { username, password })) => {
                    send(&mut writer, &credentials_reply(&username, &password)).await;
                }
                Step::Control(Some(Control::Password(password))) => {
                    send(&mut writer, &private_key_reply(&password)).await;
                }
                Step::Control(Some(Control::Stop)) | Step::Control(None) => {
                    info!("Stopping tunnel helper");
                    stopping = true;
                    send(&mut writer, "signal SIGTERM\n").await;
                }
                Step::Exited(status) => {
                    exited = Some(status);
                    break;
                }
            }
        }

        if exited.is_none() {
            let grace = self.config.kill_timeout();
            if tokio::time::timeout(grace, &mut exit).await.is_err() {
                warn!("Tunnel helper still running after {:?}, killing", grace);
                self.process.kill();
                exit.await;
            }
        }

        self.finish();
    }

    async fn on_line(&mut self, line: &str, writer: &mut OwnedWriteHalf) {
        match parse_management_line(line) {
            ManagementLine::State { name, success } => match name.as_str() {
                "CONNECTED" if success => {
                    info!("Tunnel up to {}", self.descriptor.hostname);
                    self.events.connector(ConnectorSignal::Connected);
                }
                "CONNECTED" => {
                    warn!("Tunnel up with errors");
                    self.events
                        .connector(ConnectorSignal::Error(ConnectionError::ConnectedWithErrors));
                }
                "RECONNECTING" => {
                    self.events.connector(ConnectorSignal::Reconnecting);
                }
                other => debug!("Helper state {}", other),
            },
            ManagementLine::ByteCount { bytes_in, bytes_out } => {
                self.events.connector(ConnectorSignal::Statistics {
                    bytes_in,
                    bytes_out,
                    cumulative: true,
                });
            }
            ManagementLine::NeedCredentials => {
                let creds = &self.descriptor.credentials;
                if creds.is_empty() {
                    self.events.connector(ConnectorSignal::RequestUsername);
                } else {
                    send(writer, &credentials_reply(&creds.username, &creds.password)).await;
                }
            }
            ManagementLine::NeedPrivateKey => {
                self.events.connector(ConnectorSignal::RequestPassword);
            }
            ManagementLine::AuthFailed => {
                warn!("Helper rejected credentials");
                self.events
                    .connector(ConnectorSignal::Error(ConnectionError::AuthenticationRequired));
            }
            ManagementLine::Fatal(message) => {
                error!("Helper fatal: {}", message);
                self.events.connector(ConnectorSignal::Error(fatal_error(&message)));
            }
            ManagementLine::Log(message) => {
                if let Some(adapter) = opened_adapter(&message) {
                    debug!("Adapter {} opened", adapter);
                    self.link.set_adapter(Some(adapter));
                } else if let Some(err) = transport_error(&message) {
                    self.events.connector(ConnectorSignal::Error(err));
                }
            }
            ManagementLine::Other => {}
        }
    }

    fn finish(&self) {
        self.link.disconnected.store(true, Ordering::Relaxed);
        self.link.set_adapter(None);
        self.events.connector(ConnectorSignal::Disconnected);
    }
}

async fn connect_management(port: u16, timeout: Duration) -> Option<TcpStream> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => return Some(stream),
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(MANAGEMENT_RETRY).await
            }
            Err(e) => {
                debug!("Management socket: {}", e);
                return None;
            }
        }
    }
}

/// Resolves on a stop request; prompts before the socket is up are dropped.
async fn wait_for_stop(control: &mut mpsc::UnboundedReceiver<Control>) {
    while let Some(ctl) = control.recv().await {
        if matches!(ctl, Control::Stop) {
            return;
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, text: &str) {
    if let Err(e) = writer.write_all(text.as_bytes()).await {
        warn!("Management write failed: {}", e);
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn credentials_reply(username: &str, password: &str) -> String {
    format!(
        "username \"Auth\" {}\npassword \"Auth\" {}\n",
        quote(username),
        quote(password)
    )
}

fn private_key_reply(password: &str) -> String {
    format!("password \"Private Key\" {}\n", quote(password))
}

/// Command line for the tunnel helper.
pub(crate) fn helper_args(config: &DirectConfig, descriptor: &ConnectionDescriptor) -> Vec<String> {
    let mut args = Vec::new();

    match &descriptor.custom_config {
        Some(path) => {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        None => {
            let (host, port) = descriptor.dial_target();
            let proto = if descriptor.protocol.is_udp() { "udp" } else { "tcp-client" };
            args.extend([
                "--client".to_string(),
                "--dev".to_string(),
                "tun".to_string(),
                "--proto".to_string(),
                proto.to_string(),
                "--remote".to_string(),
                host,
                port.to_string(),
            ]);
        }
    }

    args.extend([
        "--management".to_string(),
        "127.0.0.1".to_string(),
        config.management_port.to_string(),
        "--management-hold".to_string(),
        "--management-query-passwords".to_string(),
    ]);

    if let Some(proxy) = &descriptor.proxy {
        let flag = match proxy.kind {
            ProxyKind::Http => "--http-proxy",
            ProxyKind::Socks => "--socks-proxy",
        };
        args.extend([flag.to_string(), proxy.host.clone(), proxy.port.to_string()]);
    }

    if let Some(mss) = descriptor.mss {
        args.extend(["--mssfix".to_string(), mss.to_string()]);
    }

    args.extend(config.extra_args.iter().cloned());
    args
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ManagementLine {
    State { name: String, success: bool },
    ByteCount { bytes_in: u64, bytes_out: u64 },
    NeedCredentials,
    NeedPrivateKey,
    AuthFailed,
    Fatal(String),
    Log(String),
    Other,
}

pub(crate) fn parse_management_line(line: &str) -> ManagementLine {
    let line = line.trim_end();

    if let Some(rest) = line.strip_prefix(">STATE:") {
        let mut fields = rest.split(',');
        let _timestamp = fields.next();
        let name = fields.next().unwrap_or_default().to_string();
        let detail = fields.next().unwrap_or_default();
        return ManagementLine::State {
            name,
            success: detail != "ERROR",
        };
    }

    if let Some(rest) = line.strip_prefix(">BYTECOUNT:") {
        if let Some((bytes_in, bytes_out)) = rest.split_once(',') {
            if let (Ok(bytes_in), Ok(bytes_out)) =
                (bytes_in.trim().parse(), bytes_out.trim().parse())
            {
                return ManagementLine::ByteCount { bytes_in, bytes_out };
            }
        }
        return ManagementLine::Other;
    }

    if let Some(rest) = line.strip_prefix(">PASSWORD:") {
        if rest.starts_with("Verification Failed") {
            return ManagementLine::AuthFailed;
        }
        if rest.contains("'Private Key'") {
            return ManagementLine::NeedPrivateKey;
        }
        if rest.starts_with("Need 'Auth'") {
            return ManagementLine::NeedCredentials;
        }
        return ManagementLine::Other;
    }

    if let Some(rest) = line.strip_prefix(">FATAL:") {
        return ManagementLine::Fatal(rest.to_string());
    }

    if let Some(rest) = line.strip_prefix(">LOG:") {
        // >LOG:{timestamp},{flags},{message}
        let message = rest.splitn(3, ',').nth(2).unwrap_or(rest);
        return ManagementLine::Log(message.to_string());
    }

    ManagementLine::Other
}

fn fatal_error(message: &str) -> ConnectionError {
    if message.contains("There are no TAP") || message.contains("no tun device") {
        ConnectionError::NoTunnelDevice
    } else if message.contains("adapters on this system are currently in use") {
        ConnectionError::AllTunnelDevicesInUse
    } else {
        ConnectionError::ConnectedError
    }
}

fn transport_error(message: &str) -> Option<ConnectionError> {
    if message.contains("Cannot assign requested address") {
        Some(ConnectionError::UdpCantAssign)
    } else if message.contains("No buffer space available") {
        Some(ConnectionError::UdpNoBufferSpace)
    } else if message.contains("Network is down") || message.contains("Network is unreachable") {
        Some(ConnectionError::UdpNetworkDown)
    } else if message.starts_with("TCP") && message.contains("failed") {
        Some(ConnectionError::TcpError)
    } else {
        None
    }
}

fn opened_adapter(message: &str) -> Option<String> {
    message
        .strip_prefix("TUN/TAP device ")
        .and_then(|rest| rest.strip_suffix(" opened"))
        .map(str::to_string)
}
