//
// gateway.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! The operations the gateway offers to its clients.

use std::collections::HashMap;
use std::sync::Arc;

use kgshared::jupyter_message::JupyterChannel;
use kgshared::kernel_spec::KernelSpecEntry;

use crate::audit;
use crate::channel_pair::Attachment;
use crate::config::GatewayConfig;
use crate::error::KGError;
use crate::kernel_catalog::{KernelCatalog, KernelSpecCatalog};
use crate::provisioner::{KernelProvisioner, LocalProvisioner};
use crate::session::Session;
use crate::session_registry::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::ChannelTransport;
use crate::zmq_transport::ZmqTransport;

pub struct Gateway {
    config: GatewayConfig,
    registry: SessionRegistry,
    catalog: Arc<dyn KernelCatalog>,
    provisioner: Arc<dyn KernelProvisioner>,
    transport: Arc<dyn ChannelTransport>,
    shutdown: ShutdownCoordinator,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        catalog: Arc<dyn KernelCatalog>,
        provisioner: Arc<dyn KernelProvisioner>,
        transport: Arc<dyn ChannelTransport>,
    ) -> Self {
        let shutdown = ShutdownCoordinator::new(config.shutdown_timeout);
        Self {
            config,
            registry: SessionRegistry::new(),
            catalog,
            provisioner,
            transport,
            shutdown,
        }
    }

    /// Create a gateway that launches local kernels from the installed
    /// kernelspecs and talks to them over ZeroMQ.
    pub fn from_config(config: GatewayConfig) -> Self {
        let catalog: Arc<dyn KernelCatalog> =
            Arc::new(KernelSpecCatalog::new(config.kernel_paths.clone()));
        let provisioner = Arc::new(LocalProvisioner::new(
            catalog.clone(),
            config.connection_dir.clone(),
        ));
        Self::new(config, catalog, provisioner, Arc::new(ZmqTransport::new()))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Start a kernel of the given type and register a session for it.
    /// Returns the new session's ID.
    pub async fn create_session(&self, kernel_name: &str) -> Result<String, KGError> {
        log::debug!("Spawning '{}' kernel", kernel_name);
        let kernel = self.provisioner.launch(kernel_name).await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let channels = match self.transport.open(&session_id, &kernel.connection).await {
            Ok(channels) => channels,
            Err(e) => {
                log::error!(
                    "[session {}] Failed to connect to '{}' kernel: {}",
                    session_id,
                    kernel_name,
                    e
                );
                if let Err(kill_err) = kernel.process.kill().await {
                    log::error!("[session {}] Failed to kill kernel: {}", session_id, kill_err);
                }
                if let Some(path) = &kernel.connection_file_path {
                    if let Err(rm_err) = std::fs::remove_file(path) {
                        log::warn!(
                            "[session {}] Failed to remove connection file {}: {}",
                            session_id,
                            path.display(),
                            rm_err
                        );
                    }
                }
                return Err(KGError::TransportFailed(session_id, e));
            }
        };

        let session = Arc::new(Session::new(
            session_id.clone(),
            kernel_name.to_string(),
            self.config.username.clone(),
            kernel,
            channels,
        ));

        if let Err(e) = self.registry.insert(session.clone()).await {
            for err in session.close().await {
                log::error!("[session {}] {}", session_id, err);
            }
            return Err(e);
        }

        audit::session_started(&session_id, kernel_name);
        Ok(session_id)
    }

    /// Shut a session down with the `shutdown_request` handshake.
    ///
    /// The session leaves the registry once it has been torn down, whether or
    /// not every teardown step succeeded. If the kernel declines to stop, or a
    /// shutdown is already running, the session stays registered.
    pub async fn terminate_session(&self, session_id: &str) -> Result<(), KGError> {
        let session = self.registry.get(session_id).await?;
        let result = self.shutdown.shutdown(&session).await;

        if session.is_terminated() && self.registry.remove(session_id).await.is_some() {
            audit::session_stopped(session_id, &session.kernel_name, session.uptime());
        }

        result
    }

    pub async fn list_sessions(&self) -> Vec<String> {
        self.registry.list_ids().await
    }

    pub async fn list_kernel_types(&self) -> HashMap<String, KernelSpecEntry> {
        self.catalog.find_all().await
    }

    /// Attach a remote connection to one channel of a session.
    pub async fn attach(
        &self,
        session_id: &str,
        channel: JupyterChannel,
        peer: &str,
    ) -> Result<Attachment, KGError> {
        let session = self.registry.get(session_id).await?;
        session.channel(channel).attach(peer)
    }

    /// Tear down every session without a handshake and empty the registry.
    pub async fn shutdown_all(&self) {
        let sessions = self.registry.drain().await;
        if sessions.is_empty() {
            return;
        }
        log::info!("Closing {} session(s)", sessions.len());
        for session in sessions {
            for e in session.close().await {
                log::error!("[session {}] {}", session.id, e);
            }
            audit::session_stopped(&session.id, &session.kernel_name, session.uptime());
        }
    }
}
