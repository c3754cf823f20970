//! Local port allocation
//!
//! Prefers exposing a remote port under the same local port number and
//! falls back to an OS-assigned port. Only probes: the session binds again
//! for real, so a port taken in between surfaces as a startup error there.

use std::net::{IpAddr, SocketAddr, TcpListener};

use tracing::debug;

use super::error::ForwardError;

/// Outcome of [`PortAllocator::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub local_port: u16,
    /// `local_port == remote_port` was available
    pub same_port: bool,
}

#[derive(Debug, Clone)]
pub struct PortAllocator {
    bind_ip: IpAddr,
}

impl PortAllocator {
    pub fn new(bind_address: &str) -> Result<Self, ForwardError> {
        let bind_ip = bind_address
            .parse()
            .map_err(|_| ForwardError::InvalidBindAddress(bind_address.to_string()))?;
        Ok(Self { bind_ip })
    }

    pub fn bind_ip(&self) -> IpAddr {
        self.bind_ip
    }

    pub fn allocate(&self, remote_port: u16) -> Result<Allocation, ForwardError> {
        if remote_port != 0 {
            if let Ok(probe) = TcpListener::bind(SocketAddr::new(self.bind_ip, remote_port)) {
                drop(probe);
                return Ok(Allocation {
                    local_port: remote_port,
                    same_port: true,
                });
            }
            debug!("Local port {} unavailable, using an ephemeral port", remote_port);
        }

        let probe =
            TcpListener::bind(SocketAddr::new(self.bind_ip, 0)).map_err(ForwardError::Allocation)?;
        let local_port = probe.local_addr().map_err(ForwardError::Allocation)?.port();
        drop(probe);

        Ok(Allocation {
            local_port,
            same_port: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_port_is_reused() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let allocation = PortAllocator::new("127.0.0.1").unwrap().allocate(port).unwrap();
        assert_eq!(
            allocation,
            Allocation {
                local_port: port,
                same_port: true
            }
        );
    }

    #[test]
    fn test_occupied_port_falls_back() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let allocation = PortAllocator::new("127.0.0.1").unwrap().allocate(port).unwrap();
        assert!(!allocation.same_port);
        assert_ne!(allocation.local_port, port);
        assert_ne!(allocation.local_port, 0);
    }

    #[test]
    fn test_invalid_bind_address() {
        assert!(matches!(
            PortAllocator::new("localhost:80"),
            Err(ForwardError::InvalidBindAddress(_))
        ));
    }
}
