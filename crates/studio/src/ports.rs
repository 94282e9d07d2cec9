use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Attempts before giving up when the OS keeps handing back reserved ports
const MAX_ATTEMPTS: usize = 32;

/// Hands out free loopback ports for helper processes.
///
/// The OS picks the port (bind to port 0); the allocator additionally
/// remembers ports leased but not yet bound by their helper, so concurrent
/// starts never receive the same number.
#[derive(Clone, Default, Debug)]
pub struct PortAllocator {
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn reserved(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn allocate(&self) -> std::io::Result<PortLease> {
        for _ in 0..MAX_ATTEMPTS {
            let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
            let port = listener.local_addr()?.port();
            drop(listener);

            if self.reserved().insert(port) {
                debug!(port, "Allocated helper port");
                return Ok(PortLease {
                    port,
                    reserved: self.reserved.clone(),
                });
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "no free port available",
        ))
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved().contains(&port)
    }
}

/// A port held for one helper; released when dropped
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_leases_are_unique() {
        let allocator = PortAllocator::new();
        let leases: Vec<_> = (0..16).map(|_| allocator.allocate().unwrap()).collect();
        let unique: HashSet<u16> = leases.iter().map(PortLease::port).collect();
        assert_eq!(unique.len(), leases.len());
        assert!(leases.iter().all(|l| l.port() != 0));
    }

    #[test]
    fn test_lease_released_on_drop() {
        let allocator = PortAllocator::new();
        let lease = allocator.allocate().unwrap();
        let port = lease.port();
        assert!(allocator.is_reserved(port));
        drop(lease);
        assert!(!allocator.is_reserved(port));
    }

    #[test]
    fn test_allocated_port_is_bindable() {
        let allocator = PortAllocator::new();
        let lease = allocator.allocate().unwrap();
        assert!(TcpListener::bind((Ipv4Addr::LOCALHOST, lease.port())).is_ok());
    }
}
