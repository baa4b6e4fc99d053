//! Port selection for newly launched bot runtimes.

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{PublishError, Result};

/// Hands out TCP ports for bot runtimes.
///
/// The search starts one above the highest port already assigned to a tracked
/// bot, so two publishes racing each other never settle on the same "first
/// free" port before either runtime has bound it.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    default_port: u16,
    max_port: u16,
}

impl PortAllocator {
    pub fn new(default_port: u16, max_port: u16) -> Self {
        Self {
            default_port,
            max_port,
        }
    }

    /// Where the scan begins for the given set of ports in use.
    pub fn first_candidate(&self, active_ports: &[u16]) -> u16 {
        match active_ports.iter().max() {
            Some(&max) => max.saturating_add(1).max(self.default_port),
            None => self.default_port,
        }
    }

    /// Find the first bindable port at or above [`Self::first_candidate`].
    pub async fn allocate(&self, active_ports: &[u16]) -> Result<u16> {
        let start = self.first_candidate(active_ports);
        let mut port = start;
        while port < self.max_port {
            if !active_ports.contains(&port) && is_port_free(port).await {
                debug!(port, "allocated bot port");
                return Ok(port);
            }
            port += 1;
        }
        Err(PublishError::PortExhaustion {
            start,
            end: self.max_port,
        })
    }
}

/// True when a listener can currently be bound on `0.0.0.0:port`.
pub async fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).await.is_ok()
}
