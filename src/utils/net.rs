use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::{TcpListener, UdpSocket};

use crate::utils::{LanError, Result};

/// Create a UDP socket with SO_REUSEADDR (and SO_REUSEPORT on Unix),
/// broadcast permitted, converted into a tokio socket.
///
/// Several discovery services on one host can bind the same port this way.
pub fn create_discovery_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| LanError::Network(format!("Failed to create socket: {}", e)))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| LanError::Network(format!("Failed to set reuse_address: {}", e)))?;

    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    if let Err(e) = socket.set_reuse_port(true) {
        log::warn!("Could not set SO_REUSEPORT (not critical): {}", e);
    }

    socket
        .set_broadcast(true)
        .map_err(|e| LanError::Network(format!("Failed to set broadcast: {}", e)))?;

    socket
        .bind(&addr.into())
        .map_err(|e| LanError::Network(format!("Failed to bind to {}: {}", addr, e)))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| LanError::Network(format!("Failed to set nonblocking: {}", e)))?;

    UdpSocket::from_std(socket.into())
        .map_err(|e| LanError::Network(format!("Failed to convert to tokio socket: {}", e)))
}

/// Check if a TCP port is available for binding.
pub async fn is_port_available(port: u16) -> bool {
    TcpListener::bind(format!("127.0.0.1:{}", port)).await.is_ok()
}

/// Find the next available TCP port starting from a given port.
pub async fn find_available_port(start_port: u16) -> Result<u16> {
    for port in start_port..start_port + 100 {
        if is_port_available(port).await {
            return Ok(port);
        }
    }
    Err(LanError::Network("No available ports found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discovery_socket_allows_rebinding() {
        let port = find_available_port(45500).await.unwrap();
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().unwrap();

        let first = create_discovery_socket(addr).unwrap();
        let second = create_discovery_socket(addr);
        assert!(second.is_ok());
        drop(first);
    }

    #[tokio::test]
    async fn find_available_port_skips_bound_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = listener.local_addr().unwrap().port();

        let found = find_available_port(taken).await.unwrap();
        assert_ne!(found, taken);
    }
}
