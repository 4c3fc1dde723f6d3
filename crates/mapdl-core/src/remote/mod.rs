//! Solver instances created by a remote instance manager.
//!
//! The instance manager service itself is external. [`InstanceManager`] is
//! the seam a client for it implements; the lifecycle layer only needs to
//! create an instance, wait until it serves, and delete it again.

mod config;

pub use config::InstanceManagerConfig;

use crate::error::{MapdlError, Result};
use crate::options::SolverVersion;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Product name the instance manager knows the solver by.
pub const PRODUCT_NAME: &str = "mapdl";

/// A solver instance owned by an instance manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInstance {
    /// Identifier used to delete the instance.
    pub name: String,
    /// gRPC address of the solver, e.g. `dns:10.0.0.4:50052` or `10.0.0.4:50052`.
    pub address: String,
    pub ready: bool,
}

impl RemoteInstance {
    /// Host and port of the solver endpoint.
    pub fn endpoint(&self) -> Result<(String, u16)> {
        let address = self.address.trim();
        let address = address.strip_prefix("dns:").unwrap_or(address);
        let (host, port) = address.rsplit_once(':').ok_or_else(|| MapdlError::InstanceManager {
            message: format!("instance address '{}' has no port", self.address),
        })?;
        let port = port.parse::<u16>().map_err(|_| MapdlError::InstanceManager {
            message: format!("instance address '{}' has an invalid port", self.address),
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(MapdlError::InstanceManager {
                message: format!("instance address '{}' has no host", self.address),
            });
        }
        Ok((host.to_string(), port))
    }
}

/// Client of a remote instance manager.
#[async_trait]
pub trait InstanceManager: Send + Sync {
    /// Human-readable target for log lines.
    fn describe(&self) -> String;

    /// Request a new instance. The server picks the version when `None`.
    async fn create_instance(&self, product: &str, version: Option<SolverVersion>) -> Result<RemoteInstance>;

    /// Wait until the instance serves and return its refreshed description.
    async fn wait_for_ready(&self, instance: &RemoteInstance, timeout: Duration) -> Result<RemoteInstance>;

    async fn delete_instance(&self, instance: &RemoteInstance) -> Result<()>;
}

pub type DynInstanceManager = Arc<dyn InstanceManager>;

/// Create a solver instance and wait for it, deleting it if it never serves.
pub async fn launch_remote(
    manager: &dyn InstanceManager,
    version: Option<SolverVersion>,
    timeout: Duration,
) -> Result<RemoteInstance> {
    let instance = manager.create_instance(PRODUCT_NAME, version).await?;
    info!("Instance '{}' requested from {}", instance.name, manager.describe());

    let ready = match manager.wait_for_ready(&instance, timeout).await {
        Ok(ready) => ready,
        Err(e) => {
            if let Err(delete) = manager.delete_instance(&instance).await {
                warn!("Failed to delete instance '{}': {}", instance.name, delete);
            }
            return Err(e);
        }
    };
    // Fail early on an unusable address
    ready.endpoint()?;
    info!("Instance '{}' ready at {}", ready.name, ready.address);
    Ok(ready)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory instance manager that hands out a fixed address.
    pub(crate) struct FakeManager {
        pub address: String,
        pub fail_ready: bool,
        pub deleted: Mutex<Vec<String>>,
    }

    impl FakeManager {
        pub(crate) fn new(address: impl Into<String>) -> Self {
            Self {
                address: address.into(),
                fail_ready: false,
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InstanceManager for FakeManager {
        fn describe(&self) -> String {
            "fake".into()
        }

        async fn create_instance(&self, product: &str, _version: Option<SolverVersion>) -> Result<RemoteInstance> {
            Ok(RemoteInstance {
                name: format!("instances/{}-1", product),
                address: self.address.clone(),
                ready: false,
            })
        }

        async fn wait_for_ready(&self, instance: &RemoteInstance, timeout: Duration) -> Result<RemoteInstance> {
            if self.fail_ready {
                return Err(MapdlError::InstanceManager {
                    message: format!("not ready after {:?}", timeout),
                });
            }
            Ok(RemoteInstance {
                ready: true,
                ..instance.clone()
            })
        }

        async fn delete_instance(&self, instance: &RemoteInstance) -> Result<()> {
            self.deleted.lock().unwrap().push(instance.name.clone());
            Ok(())
        }
    }

    #[test]
    fn test_endpoint_parsing() {
        let instance = |address: &str| RemoteInstance {
            name: "i".into(),
            address: address.into(),
            ready: true,
        };
        assert_eq!(instance("dns:10.0.0.4:50052").endpoint().unwrap(), ("10.0.0.4".into(), 50052));
        assert_eq!(instance("solver:50100").endpoint().unwrap(), ("solver".into(), 50100));
        assert_eq!(instance("[::1]:50052").endpoint().unwrap(), ("::1".into(), 50052));
        assert!(instance("10.0.0.4").endpoint().is_err());
        assert!(instance("10.0.0.4:http").endpoint().is_err());
        assert!(instance(":50052").endpoint().is_err());
    }

    #[tokio::test]
    async fn test_launch_remote_ready() {
        let manager = FakeManager::new("dns:127.0.0.1:50052");
        let instance = launch_remote(&manager, None, Duration::from_secs(1)).await.unwrap();
        assert!(instance.ready);
        assert_eq!(instance.name, "instances/mapdl-1");
        assert!(manager.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_launch_remote_deletes_on_failure() {
        let mut manager = FakeManager::new("127.0.0.1:50052");
        manager.fail_ready = true;
        let err = launch_remote(&manager, None, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, MapdlError::InstanceManager { .. }));
        assert_eq!(*manager.deleted.lock().unwrap(), vec!["instances/mapdl-1".to_string()]);
    }
}
