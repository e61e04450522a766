//! Port-fallback listener
//!
//! Binds the first free port from an ordered candidate list. "Address in use"
//! moves on to the next candidate; every other bind error is fatal.

use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ListenError {
    /// Every candidate port was already in use
    #[error("no available port found, tried: {}", join_ports(.tried))]
    Exhausted { tried: Vec<u16> },

    /// A bind failure other than "address in use"
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A listening socket together with the address it actually bound
#[derive(Debug)]
pub struct BoundListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundListener {
    /// The bound port, read back from the socket
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn into_inner(self) -> TcpListener {
        self.listener
    }
}

/// Remove repeated ports while keeping the first occurrence of each
fn dedup_ports(ports: &[u16]) -> Vec<u16> {
    let mut unique = Vec::with_capacity(ports.len());
    for &port in ports {
        if !unique.contains(&port) {
            unique.push(port);
        }
    }
    unique
}

fn is_addr_in_use(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::AddrInUse
}

/// Bind `host` on the first available port of `ports`
pub async fn bind_with_fallback(host: IpAddr, ports: &[u16]) -> Result<BoundListener, ListenError> {
    let candidates = dedup_ports(ports);

    for &port in &candidates {
        debug!(%host, port, "Trying to bind");
        match TcpListener::bind(SocketAddr::new(host, port)).await {
            Ok(listener) => {
                let local_addr = listener
                    .local_addr()
                    .map_err(|source| ListenError::Bind { port, source })?;
                info!(addr = %local_addr, port = local_addr.port(), "Listener bound");
                return Ok(BoundListener {
                    listener,
                    local_addr,
                });
            }
            Err(e) if is_addr_in_use(&e) => {
                warn!(port, "Port in use, trying next");
            }
            Err(source) => return Err(ListenError::Bind { port, source }),
        }
    }

    Err(ListenError::Exhausted { tried: candidates })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const ANY: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    #[test]
    fn test_dedup_ports_keeps_order() {
        assert_eq!(dedup_ports(&[3001, 3001, 3002]), vec![3001, 3002]);
        assert_eq!(dedup_ports(&[3002, 3000, 3002, 3001]), vec![3002, 3000, 3001]);
        assert!(dedup_ports(&[]).is_empty());
    }

    #[test]
    fn test_exhausted_message_lists_ports() {
        let err = ListenError::Exhausted {
            tried: vec![3000, 3001, 3002],
        };
        assert_eq!(err.to_string(), "no available port found, tried: 3000, 3001, 3002");
    }

    #[tokio::test]
    async fn test_falls_back_when_port_in_use() {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let taken = occupied.local_addr().unwrap().port();

        let bound = bind_with_fallback(ANY, &[taken, 0]).await.unwrap();

        assert_ne!(bound.port(), taken);
        assert_ne!(bound.port(), 0);
        assert_eq!(bound.port(), bound.into_inner().local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn test_exhausted_when_all_ports_taken() {
        let first = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let second = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let ports = [
            first.local_addr().unwrap().port(),
            second.local_addr().unwrap().port(),
        ];

        match bind_with_fallback(ANY, &ports).await {
            Err(ListenError::Exhausted { tried }) => assert_eq!(tried, ports.to_vec()),
            other => panic!("expected exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_candidates_are_exhausted() {
        let result = bind_with_fallback(ANY, &[]).await;
        assert!(matches!(result, Err(ListenError::Exhausted { tried }) if tried.is_empty()));
    }

    #[tokio::test]
    async fn test_unassigned_address_is_fatal() {
        // TEST-NET-3, never assigned to a local interface
        let host: IpAddr = "203.0.113.7".parse().unwrap();

        match bind_with_fallback(host, &[0, 0]).await {
            Err(ListenError::Bind { port, .. }) => assert_eq!(port, 0),
            other => panic!("expected bind error, got {:?}", other),
        }
    }
}
