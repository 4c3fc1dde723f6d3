//! Process-wide registry of claimed solver ports.

use super::owner::{find_owner, PortOwner};
use crate::config::LaunchDefaults;
use crate::error::{MapdlError, Result};
use std::net::TcpListener;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use tracing::{debug, info, warn};

static GLOBAL_REGISTRY: LazyLock<Arc<PortRegistry>> = LazyLock::new(|| Arc::new(PortRegistry::new()));

/// Ports claimed by sessions of this process.
///
/// Within one registry no two claims share a port. Claims are released by
/// session teardown; releasing an unclaimed port is a no-op.
#[derive(Debug)]
pub struct PortRegistry {
    claimed: Mutex<Vec<u16>>,
    default_port: u16,
    probe_host: String,
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::with_default_port(LaunchDefaults::PORT)
    }

    /// Registry whose automatic allocation starts at `port`.
    pub fn with_default_port(port: u16) -> Self {
        Self {
            claimed: Mutex::new(Vec::new()),
            default_port: port,
            probe_host: LaunchDefaults::IP.to_string(),
        }
    }

    /// The registry shared by every session of this process.
    pub fn global() -> Arc<PortRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    /// Check a port number is in the accepted range (exclusive bounds).
    pub fn validate(port: u32) -> Result<u16> {
        if port > u32::from(LaunchDefaults::MIN_PORT) && port < u32::from(LaunchDefaults::MAX_PORT) {
            Ok(port as u16)
        } else {
            Err(MapdlError::InvalidPort {
                port,
                min: LaunchDefaults::MIN_PORT,
                max: LaunchDefaults::MAX_PORT,
            })
        }
    }

    /// True when a TCP socket can be bound to `(host, port)`.
    ///
    /// Any bind failure, including permission errors, counts as not free.
    pub fn is_port_free(port: u16, host: &str) -> bool {
        match TcpListener::bind((host, port)) {
            Ok(_) => true,
            Err(e) => {
                debug!("Port {} on {} is not usable: {}", port, host, e);
                false
            }
        }
    }

    /// The process listening on `port`, if any can be found.
    pub fn find_owning_process(port: u16) -> Option<PortOwner> {
        find_owner(port)
    }

    /// Choose and claim a port.
    ///
    /// With an explicit port, the port is claimed as-is unless `probe` finds
    /// it busy, in which case the error names the kind of owner. Without
    /// one, the search starts one past the highest claim (or at the default)
    /// and skips claimed and, when probing, busy ports.
    pub fn allocate(&self, explicit: Option<u16>, probe: bool) -> Result<u16> {
        let mut claimed = self.lock();

        let port = match explicit {
            Some(port) => {
                Self::validate(u32::from(port))?;
                if claimed.contains(&port) {
                    return Err(MapdlError::PortBusyBySolver {
                        port,
                        pid: std::process::id(),
                    });
                }
                if probe && !Self::is_port_free(port, &self.probe_host) {
                    return Err(busy_error(port));
                }
                port
            }
            None => {
                let mut port = claimed
                    .iter()
                    .max()
                    .map(|p| p.saturating_add(1))
                    .unwrap_or(self.default_port);
                debug!("Searching for a free port from {}", port);
                loop {
                    if port >= LaunchDefaults::MAX_PORT {
                        return Err(MapdlError::InvalidPort {
                            port: u32::from(port),
                            min: LaunchDefaults::MIN_PORT,
                            max: LaunchDefaults::MAX_PORT,
                        });
                    }
                    if !claimed.contains(&port)
                        && !(probe && !Self::is_port_free(port, &self.probe_host))
                    {
                        break port;
                    }
                    port = port.saturating_add(1);
                }
            }
        };

        claimed.push(port);
        info!("Claimed port {}", port);
        Ok(port)
    }

    /// Release a claim. Returns whether the port was claimed.
    pub fn release(&self, port: u16) -> bool {
        let mut claimed = self.lock();
        match claimed.iter().position(|p| *p == port) {
            Some(index) => {
                claimed.remove(index);
                debug!("Released port {}", port);
                true
            }
            None => false,
        }
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Snapshot of the claimed ports.
    pub fn claimed(&self) -> Vec<u16> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u16>> {
        // A panic while holding the lock cannot leave the list half-updated
        self.claimed.lock().unwrap_or_else(|poisoned| {
            warn!("Port registry lock was poisoned; continuing");
            poisoned.into_inner()
        })
    }
}

fn busy_error(port: u16) -> MapdlError {
    match find_owner(port) {
        Some(owner) if owner.is_solver() => MapdlError::PortBusyBySolver {
            port,
            pid: owner.pid,
        },
        Some(owner) => MapdlError::PortBusyByOther {
            port,
            pid: owner.pid,
            name: owner.name,
        },
        None => MapdlError::PortBusyUnknownOwner { port },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_validate_bounds() {
        assert!(PortRegistry::validate(1000).is_err());
        assert_eq!(PortRegistry::validate(1001).unwrap(), 1001);
        assert_eq!(PortRegistry::validate(59999).unwrap(), 59999);
        assert!(PortRegistry::validate(60000).is_err());
        assert!(PortRegistry::validate(70000).is_err());
    }

    #[test]
    fn test_is_port_free_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!PortRegistry::is_port_free(port, "127.0.0.1"));
        drop(listener);
        assert!(PortRegistry::is_port_free(port, "127.0.0.1"));
    }

    #[test]
    fn test_sequential_allocations_are_distinct() {
        let registry = PortRegistry::new();
        let ports: Vec<u16> = (0..5).map(|_| registry.allocate(None, true).unwrap()).collect();

        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), ports.len());
        assert!(ports.windows(2).all(|w| w[1] > w[0]));
        assert!(ports[0] >= LaunchDefaults::PORT);
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let registry = Arc::new(PortRegistry::with_default_port(52000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.allocate(None, false).unwrap())
            })
            .collect();
        let ports: HashSet<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ports.len(), 8);
    }

    #[test]
    fn test_allocation_skips_busy_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = listener.local_addr().unwrap().port();

        let registry = PortRegistry::with_default_port(busy);
        let port = registry.allocate(None, true).unwrap();
        assert_ne!(port, busy);
        assert!(port > busy);
    }

    #[test]
    fn test_explicit_busy_port_by_other_process() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let registry = PortRegistry::new();

        let err = registry.allocate(Some(port), true).unwrap_err();
        assert!(
            matches!(
                err,
                MapdlError::PortBusyByOther { .. } | MapdlError::PortBusyUnknownOwner { .. }
            ),
            "unexpected error: {:?}",
            err
        );
        assert!(registry.claimed().is_empty());
    }

    #[test]
    fn test_explicit_port_without_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let registry = PortRegistry::new();
        assert_eq!(registry.allocate(Some(port), false).unwrap(), port);
    }

    #[test]
    fn test_explicit_port_claimed_twice() {
        let registry = PortRegistry::new();
        let port = free_port();
        registry.allocate(Some(port), false).unwrap();
        assert!(matches!(
            registry.allocate(Some(port), false),
            Err(MapdlError::PortBusyBySolver { .. })
        ));
    }

    #[test]
    fn test_search_stops_below_max_port() {
        let registry = PortRegistry::new();
        registry.allocate(Some(59999), false).unwrap();

        let err = registry.allocate(None, false).unwrap_err();
        assert!(
            matches!(err, MapdlError::InvalidPort { port: 60000, .. }),
            "unexpected error: {:?}",
            err
        );
        assert_eq!(registry.claimed(), vec![59999]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = PortRegistry::new();
        let port = registry.allocate(None, false).unwrap();
        assert!(registry.release(port));
        assert!(!registry.release(port));
        assert!(!registry.is_claimed(port));
    }

    #[test]
    fn test_next_allocation_follows_highest_claim() {
        let registry = PortRegistry::with_default_port(53000);
        let first = registry.allocate(Some(53010), false).unwrap();
        let next = registry.allocate(None, false).unwrap();
        assert_eq!(first, 53010);
        assert_eq!(next, 53011);
    }
}
