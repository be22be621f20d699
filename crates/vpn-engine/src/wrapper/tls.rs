//! TLS wrapper: tunnel traffic inside a TLS session to the server.

use super::{ProcessWrapper, WrapperFlavor, WrapperKind};
use crate::config::{WrapperConfig, WrapperProcessConfig};

pub struct Tls;

impl WrapperFlavor for Tls {
    const KIND: WrapperKind = WrapperKind::Tls;

    fn process_config(config: &WrapperConfig) -> &WrapperProcessConfig {
        &config.tls
    }

    fn args(local_port: u16, remote_host: &str, remote_port: u16) -> Vec<String> {
        vec![
            "--client".to_string(),
            "--accept".to_string(),
            format!("127.0.0.1:{local_port}"),
            "--connect".to_string(),
            format!("{remote_host}:{remote_port}"),
        ]
    }
}

pub type TlsWrapper = ProcessWrapper<Tls>;
