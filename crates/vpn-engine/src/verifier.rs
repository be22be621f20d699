//! Post-connect tunnel verification
//!
//! Once the connector reports `Connected`, the orchestrator asks the
//! verifier to prove traffic actually flows. [`ReachabilityVerifier`] does a
//! plain HTTP GET to an endpoint that echoes the caller's public address.

use crate::config::VerifierConfig;
use crate::descriptor::ConnectionDescriptor;
use crate::event::{EventSink, VerifierOutcome};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Method, Request};
use std::net::IpAddr;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PROBE_USER_AGENT: &str = concat!("vpn-engine/", env!("CARGO_PKG_VERSION"));

pub trait TunnelVerifier: Send {
    /// Begin verifying; exactly one outcome is reported unless stopped first.
    fn start(&mut self, descriptor: &ConnectionDescriptor, events: EventSink);

    fn stop(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("Response is not an address: {0:?}")]
    InvalidAddress(String),
}

pub struct ReachabilityVerifier {
    runtime: Handle,
    config: VerifierConfig,
    task: Option<JoinHandle<()>>,
}

impl ReachabilityVerifier {
    pub fn new(runtime: Handle, config: VerifierConfig) -> Self {
        Self {
            runtime,
            config,
            task: None,
        }
    }
}

impl TunnelVerifier for ReachabilityVerifier {
    fn start(&mut self, descriptor: &ConnectionDescriptor, events: EventSink) {
        self.stop();

        debug!(
            "Verifying tunnel to {} via {}:{}",
            descriptor.hostname, self.config.probe_host, self.config.probe_port
        );
        let config = self.config.clone();
        self.task = Some(self.runtime.spawn(async move {
            for attempt in 1..=config.attempts {
                match tokio::time::timeout(config.attempt_timeout(), probe(&config)).await {
                    Ok(Ok(address)) => {
                        info!("Tunnel verified, public address {}", address);
                        events.verifier(VerifierOutcome::Verified(address));
                        return;
                    }
                    Ok(Err(e)) => debug!("Probe attempt {} failed: {}", attempt, e),
                    Err(_) => debug!("Probe attempt {} timed out", attempt),
                }
                if attempt < config.attempts {
                    tokio::time::sleep(config.retry_delay()).await;
                }
            }

            warn!("Tunnel verification failed after {} attempts", config.attempts);
            events.verifier(VerifierOutcome::Failed);
        }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ReachabilityVerifier {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One GET to the probe endpoint; returns the reported address.
pub async fn probe(config: &VerifierConfig) -> Result<String, ProbeError> {
    let stream = TcpStream::connect((config.probe_host.as_str(), config.probe_port))
        .await
        .map_err(|e| ProbeError::Connect(e.to_string()))?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Probe connection error: {}", e);
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri(config.probe_path.as_str())
        .header(HOST, config.probe_host.as_str())
        .header(USER_AGENT, PROBE_USER_AGENT)
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProbeError::Http(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::Status(status.as_u16()));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?
        .to_bytes();

    parse_address(&body)
}

fn parse_address(body: &[u8]) -> Result<String, ProbeError> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    text.parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| ProbeError::InvalidAddress(text.chars().take(64).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Candidate, CandidateSource};
    use crate::descriptor::{AttemptContext, ServerCredentials};
    use crate::event::{Event, Generation};
    use crate::protocol::Protocol;
    use crossbeam_channel::unbounded;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned response per connection.
    async fn echo_server(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        port
    }

    fn config(port: u16, attempts: u32) -> VerifierConfig {
        VerifierConfig {
            probe_host: "127.0.0.1".into(),
            probe_port: port,
            probe_path: "/".into(),
            attempts,
            attempt_timeout_ms: 1_000,
            retry_delay_ms: 10,
        }
    }

    fn descriptor() -> ConnectionDescriptor {
        let candidate = Candidate {
            hostname: "se-sto-01.example.net".into(),
            ip: "192.0.2.44".parse().unwrap(),
            dns_name: None,
            protocol: Protocol::DirectUdp,
            port: 1194,
            source: CandidateSource::DefaultLocation,
        };
        let server = ServerCredentials::default();
        ConnectionDescriptor::for_attempt(
            &candidate,
            AttemptContext {
                generation: Generation(9),
                server_credentials: &server,
                custom_credentials: None,
                wrapper_port: None,
                proxy: None,
                mss: None,
            },
        )
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address(b"203.0.113.7\n"), Ok("203.0.113.7".to_string()));
        assert_eq!(parse_address(b" 2001:db8::1 "), Ok("2001:db8::1".to_string()));
        assert!(matches!(parse_address(b"<html>"), Err(ProbeError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_probe_reads_address() {
        let port = echo_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 12\r\nConnection: close\r\n\r\n203.0.113.7\n",
        )
        .await;

        assert_eq!(probe(&config(port, 1)).await, Ok("203.0.113.7".to_string()));
    }

    #[tokio::test]
    async fn test_probe_rejects_error_status() {
        let port = echo_server(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        assert_eq!(probe(&config(port, 1)).await, Err(ProbeError::Status(503)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_verifier_reports_outcomes() {
        let port = echo_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\n192.0.2.1\n",
        )
        .await;
        let (tx, rx) = unbounded();

        let mut verifier = ReachabilityVerifier::new(Handle::current(), config(port, 1));
        verifier.start(&descriptor(), EventSink::new(tx.clone(), Generation(9)));
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Verifier { generation, outcome } => {
                assert_eq!(generation, Generation(9));
                assert_eq!(outcome, VerifierOutcome::Verified("192.0.2.1".into()));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Nothing listens on the freed port
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let mut verifier = ReachabilityVerifier::new(Handle::current(), config(closed_port, 2));
        verifier.start(&descriptor(), EventSink::new(tx, Generation(10)));
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Verifier { outcome, .. } => assert_eq!(outcome, VerifierOutcome::Failed),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
