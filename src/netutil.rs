//! Local Port Probing

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpListener;
use tracing::debug;

/// True when a TCP listener could bind `ip:port` right now
pub async fn is_local_port_free(ip: IpAddr, port: u16) -> bool {
    match TcpListener::bind(SocketAddr::new(ip, port)).await {
        Ok(_) => true,
        Err(e) => {
            debug!("Port {}:{} unavailable: {}", ip, port, e);
            false
        }
    }
}

/// First free TCP port in `start..start + max_ports` on `ip`
pub async fn find_free_local_port(ip: IpAddr, start: u16, max_ports: u16) -> Option<u16> {
    let end = start.saturating_add(max_ports);
    for port in start..end {
        if is_local_port_free(ip, port).await {
            return Some(port);
        }
    }
    None
}
