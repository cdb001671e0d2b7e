//! Network module - Handles the TCP connection to the grid server
//!
//! Provides:
//! - Framed connection halves
//! - Request/response correlation
//! - The client connection manager
//! - A grid server simulator for tests and demos

mod client;
mod connection;
mod correlation;
mod server;

pub use client::*;
pub use connection::*;
pub use correlation::*;
pub use server::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{VersionInfo, MAX_FRAME_SIZE};

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// How long to wait for a single reply
    pub request_timeout_ms: u64,
    /// How long to wait for all parts of a download
    pub transfer_timeout_ms: u64,
    /// How long a single frame may take to write
    pub write_timeout_ms: u64,
    /// Maximum frame size, header included
    pub max_frame_size: usize,
    /// Version stamped on uploaded configurations
    pub version: VersionInfo,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1000,
            heartbeat_interval_ms: 2000,
            request_timeout_ms: 1000,
            transfer_timeout_ms: 5000,
            write_timeout_ms: 1000,
            max_frame_size: MAX_FRAME_SIZE,
            version: VersionInfo::default(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
