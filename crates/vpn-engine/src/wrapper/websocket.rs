//! WebSocket wrapper: tunnel traffic over `wss://` to the server.
//!
//! The server side terminates the WebSocket and forwards to its local
//! tunnel endpoint on the same port number.

use super::{ProcessWrapper, WrapperFlavor, WrapperKind};
use crate::config::{WrapperConfig, WrapperProcessConfig};

pub struct WebSocket;

impl WrapperFlavor for WebSocket {
    const KIND: WrapperKind = WrapperKind::WebSocket;

    fn process_config(config: &WrapperConfig) -> &WrapperProcessConfig {
        &config.websocket
    }

    fn args(local_port: u16, remote_host: &str, remote_port: u16) -> Vec<String> {
        vec![
            "client".to_string(),
            "-L".to_string(),
            format!("tcp://127.0.0.1:{local_port}:127.0.0.1:{remote_port}"),
            format!("wss://{remote_host}:{remote_port}"),
        ]
    }
}

pub type WebSocketWrapper = ProcessWrapper<WebSocket>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let args = WebSocket::args(1195, "edge.example.net", 443);
        assert_eq!(args[0], "client");
        assert_eq!(args[2], "tcp://127.0.0.1:1195:127.0.0.1:443");
        assert_eq!(args[3], "wss://edge.example.net:443");
    }
}
