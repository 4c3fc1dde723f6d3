//! Scheduler commands over SSH to a cluster login node.

use super::runner::{CommandOutput, CommandRunner};
use super::SshTarget;
use crate::config::HpcConfig;
use crate::error::{MapdlError, Result};
use async_trait::async_trait;
use russh::client::{AuthResult, Config, Handle, Handler};
use russh::keys::known_hosts::{learn_known_hosts, learn_known_hosts_path};
use russh::keys::PrivateKeyWithHashAlg;
use russh::ChannelMsg;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Server key check against the user's known-hosts file.
///
/// Unknown hosts are learned; a changed key is rejected.
#[derive(Debug, Clone)]
struct KnownHostsHandler {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

impl Handler for KnownHostsHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let known = match &self.known_hosts {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, server_public_key, path),
            None => russh::keys::check_known_hosts(&self.host, self.port, server_public_key),
        };
        match known {
            Ok(true) => Ok(true),
            Ok(false) => {
                info!("Learning the host key of {}:{}", self.host, self.port);
                let learned = match &self.known_hosts {
                    Some(path) => learn_known_hosts_path(&self.host, self.port, server_public_key, path),
                    None => learn_known_hosts(&self.host, self.port, server_public_key),
                };
                if let Err(e) = learned {
                    warn!("Could not record the host key of {}: {}", self.host, e);
                }
                Ok(true)
            }
            Err(e) => {
                warn!("Host key verification failed for {}:{}: {}", self.host, self.port, e);
                Ok(false)
            }
        }
    }
}

/// Runs scheduler commands on a login node with public-key authentication.
pub struct SshRunner {
    target: SshTarget,
    config: Arc<Config>,
    handle: Mutex<Option<Handle<KnownHostsHandler>>>,
}

impl SshRunner {
    pub fn new(target: SshTarget) -> Self {
        let config = Config {
            inactivity_timeout: Some(HpcConfig::SSH_INACTIVITY_TIMEOUT),
            ..Default::default()
        };
        Self {
            target,
            config: Arc::new(config),
            handle: Mutex::new(None),
        }
    }

    fn error(&self, command: &str, message: impl std::fmt::Display) -> MapdlError {
        MapdlError::Scheduler {
            command: command.to_string(),
            message: format!("{} ({})", message, self.describe()),
        }
    }

    async fn connect(&self) -> Result<Handle<KnownHostsHandler>> {
        let handler = KnownHostsHandler {
            host: self.target.host.clone(),
            port: self.target.port,
            known_hosts: self.target.known_hosts.clone(),
        };
        let mut handle = russh::client::connect(
            self.config.clone(),
            (self.target.host.as_str(), self.target.port),
            handler,
        )
        .await
        .map_err(|e| self.error("ssh", format!("connection failed: {}", e)))?;

        let key = russh::keys::load_secret_key(&self.target.key_path, None).map_err(|e| {
            self.error(
                "ssh",
                format!("failed to load key {}: {}", self.target.key_path.display(), e),
            )
        })?;
        let hash = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| self.error("ssh", e))?
            .flatten();
        let auth = handle
            .authenticate_publickey(
                self.target.user.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash),
            )
            .await
            .map_err(|e| self.error("ssh", e))?;

        match auth {
            AuthResult::Success => {
                info!("Authenticated to {}@{}", self.target.user, self.target.host);
                Ok(handle)
            }
            AuthResult::Failure { remaining_methods, .. } => Err(self.error(
                "ssh",
                format!("authentication failed (remaining methods: {:?})", remaining_methods),
            )),
        }
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut guard = self.handle.lock().await;
        if guard.as_ref().map(|h| h.is_closed()).unwrap_or(true) {
            *guard = Some(self.connect().await?);
        }
        let Some(handle) = guard.as_ref() else {
            return Err(self.error(command, "SSH handle lost"));
        };

        debug!("Running scheduler command over SSH: {}", command);
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| self.error(command, e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| self.error(command, e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut status = -1;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => status = exit_status as i32,
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        let _ = channel.close().await;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            status,
        })
    }

    fn describe(&self) -> String {
        format!("{}@{}:{}", self.target.user, self.target.host, self.target.port)
    }
}
