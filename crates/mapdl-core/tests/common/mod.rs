//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use mapdl_core::connection::ConnectOptions;
use mapdl_core::options::{resolve_with, InstallationScanner};
use mapdl_core::platform::TargetPlatform;
use mapdl_core::rpc::{SolverServer, SolverServerHandle, SolverService, Status, StatusResult};
use mapdl_core::{EnvSnapshot, LaunchConfig, LaunchOptions, LaunchServices, PortRegistry, SettingsStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Every test gets its own stretch of ports so parallel tests never collide.
static NEXT_PORT: AtomicU16 = AtomicU16::new(52100);

/// A solver stand-in: runs commands, stores parameters and files.
#[derive(Default)]
pub struct FakeSolver {
    pub commands: Mutex<Vec<String>>,
    pub params: Mutex<HashMap<String, String>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl SolverService for FakeSolver {
    async fn run_command(&self, command: &str) -> StatusResult<String> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(format!("ran {}", command))
    }

    async fn inquire(&self, function: &str) -> StatusResult<String> {
        match function {
            "JOBNAME" => Ok("file".to_string()),
            other => Err(Status::invalid_argument(other)),
        }
    }

    async fn set_parameter(&self, name: &str, value: &str) -> StatusResult<()> {
        self.params.lock().unwrap().insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn get_scalar(&self, query: &str) -> StatusResult<String> {
        let name = query.split(',').nth(1).unwrap_or_default();
        self.params
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Status::not_found(name))
    }

    async fn upload(&self, name: &str, data: Vec<u8>) -> StatusResult<u64> {
        let len = data.len() as u64;
        self.files.lock().unwrap().insert(name.to_string(), data);
        Ok(len)
    }

    async fn download(&self, name: &str) -> StatusResult<Vec<u8>> {
        Ok(self.files.lock().unwrap().get(name).cloned().unwrap_or_default())
    }
}

impl FakeSolver {
    pub fn ran(&self, command: &str) -> bool {
        self.commands.lock().unwrap().iter().any(|c| c == command)
    }
}

/// A port inside the accepted range that nothing listens on right now.
pub fn free_port() -> u16 {
    let start = NEXT_PORT.fetch_add(25, Ordering::SeqCst);
    PortRegistry::with_default_port(start)
        .allocate(None, true)
        .expect("a free port near the test range")
}

pub async fn start_solver(service: Arc<FakeSolver>) -> SolverServerHandle {
    let port = free_port();
    SolverServer::bind(&format!("127.0.0.1:{}", port), service)
        .await
        .expect("solver stand-in must bind")
}

pub fn resolve(opts: &LaunchOptions, env: &EnvSnapshot, registry: &PortRegistry) -> mapdl_core::Result<LaunchConfig> {
    resolve_with(
        opts,
        env,
        &SettingsStore::empty(),
        registry,
        &InstallationScanner::with_roots(vec![]),
        TargetPlatform::Posix,
    )
}

pub fn services(registry: Arc<PortRegistry>, env: EnvSnapshot) -> LaunchServices {
    LaunchServices::default()
        .with_registry(registry)
        .with_env(env)
        .with_connect_options(ConnectOptions::default().with_timeout(Duration::from_secs(5)))
}
