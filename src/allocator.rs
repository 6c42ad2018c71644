//! Ephemeral port allocation for server-side listeners.

use tokio::net::{TcpListener, UdpSocket};

use crate::config::Protocol;
use crate::error::{Error, Result};

/// Claim an ephemeral port for the given protocol by binding port 0 and
/// reading back the kernel's choice. The probe socket is released before the
/// real listener opens; the narrow window in which another process could
/// grab the port is accepted.
pub async fn allocate(protocol: Protocol) -> Result<u16> {
    let port = match protocol {
        Protocol::Tcp => {
            let listener = TcpListener::bind("0.0.0.0:0")
                .await
                .map_err(|e| Error::allocation_with_source("failed to bind TCP probe socket", e))?;
            listener
                .local_addr()
                .map_err(|e| Error::allocation_with_source("TCP probe socket has no address", e))?
                .port()
        }
        Protocol::Udp => {
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| Error::allocation_with_source("failed to bind UDP probe socket", e))?;
            socket
                .local_addr()
                .map_err(|e| Error::allocation_with_source("UDP probe socket has no address", e))?
                .port()
        }
    };

    log::debug!("allocated {} port {}", protocol, port);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_allocations_are_distinct_and_in_range() {
        for protocol in [Protocol::Tcp, Protocol::Udp] {
            let mut seen = HashSet::new();
            for _ in 0..5 {
                let port = allocate(protocol).await.expect("allocate");
                assert!(port >= 1024, "kernel handed out a privileged port");
                assert!(seen.insert(port), "duplicate port {}", port);
            }
        }
    }

    #[tokio::test]
    async fn test_allocated_port_is_bindable() {
        let port = allocate(Protocol::Udp).await.expect("allocate");
        UdpSocket::bind(("0.0.0.0", port))
            .await
            .expect("rebind allocated port");
    }
}
