//! Listener configuration.

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};

use super::defaults;

/// One listening socket.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenBlock {
    /// Address to bind.
    pub host: IpAddr,
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Accept server links instead of clients on this port.
    #[serde(default)]
    pub server: bool,
}

impl ListenBlock {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
