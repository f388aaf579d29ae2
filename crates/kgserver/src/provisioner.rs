//
// provisioner.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Starting kernel processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connection_file::{ConnectionFile, ReservedPorts};
use crate::error::KGError;
use crate::kernel_catalog::KernelCatalog;
use crate::kernel_process::{KernelHandle, KernelProcess};

/// A kernel that has been started but not yet connected to.
pub struct ProvisionedKernel {
    /// Handle used to kill the kernel
    pub process: Box<dyn KernelHandle>,

    /// The ports and key the kernel is listening with
    pub connection: ConnectionFile,

    /// Where the connection file was written, if it was written to disk
    pub connection_file_path: Option<PathBuf>,
}

/// Starts kernels of a named type.
#[async_trait]
pub trait KernelProvisioner: Send + Sync {
    async fn launch(&self, kernel_name: &str) -> Result<ProvisionedKernel, KGError>;
}

/// Starts kernels as child processes on this machine, using the installed
/// kernelspecs.
pub struct LocalProvisioner {
    catalog: Arc<dyn KernelCatalog>,

    /// Directory connection files are written to
    connection_dir: PathBuf,

    reserved_ports: ReservedPorts,

    /// The address kernels are asked to bind to
    ip: String,
}

impl LocalProvisioner {
    pub fn new(catalog: Arc<dyn KernelCatalog>, connection_dir: PathBuf) -> Self {
        Self {
            catalog,
            connection_dir,
            reserved_ports: ReservedPorts::new(),
            ip: String::from("127.0.0.1"),
        }
    }

    pub fn reserved_ports(&self) -> &ReservedPorts {
        &self.reserved_ports
    }
}

/// Replace the kernelspec placeholders in an argument.
fn substitute(arg: &str, connection_file: &str, resource_dir: &str) -> String {
    arg.replace("{connection_file}", connection_file)
        .replace("{resource_dir}", resource_dir)
}

#[async_trait]
impl KernelProvisioner for LocalProvisioner {
    async fn launch(&self, kernel_name: &str) -> Result<ProvisionedKernel, KGError> {
        let entry = match self.catalog.find(kernel_name).await {
            Some(entry) => entry,
            None => {
                return Err(KGError::ProvisionFailed(
                    kernel_name.to_string(),
                    anyhow::anyhow!("No kernel named '{}' is installed", kernel_name),
                ));
            }
        };

        let connection = ConnectionFile::generate(self.ip.clone(), &self.reserved_ports)
            .map_err(|e| KGError::ProvisionFailed(kernel_name.to_string(), e))?;

        if let Err(e) = std::fs::create_dir_all(&self.connection_dir) {
            self.reserved_ports.release(&connection);
            return Err(KGError::ProvisionFailed(kernel_name.to_string(), e.into()));
        }
        let connection_path = self
            .connection_dir
            .join(format!("kernel-{}.json", uuid::Uuid::new_v4()));
        if let Err(e) = connection.to_file(&connection_path) {
            self.reserved_ports.release(&connection);
            return Err(KGError::ProvisionFailed(kernel_name.to_string(), e));
        }

        let connection_path_str = connection_path.to_string_lossy().to_string();
        let argv: Vec<String> = entry
            .spec
            .argv
            .iter()
            .map(|arg| substitute(arg, &connection_path_str, &entry.resource_dir))
            .collect();

        log::debug!("Starting '{}' kernel: {}", kernel_name, argv.join(" "));

        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(&entry.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Err(remove_err) = std::fs::remove_file(&connection_path) {
                    log::warn!(
                        "Failed to remove connection file {}: {}",
                        connection_path.display(),
                        remove_err
                    );
                }
                self.reserved_ports.release(&connection);
                return Err(KGError::ProvisionFailed(
                    kernel_name.to_string(),
                    anyhow::anyhow!("Failed to start '{}': {}", argv[0], e),
                ));
            }
        };

        let process = KernelProcess::monitor(
            kernel_name,
            child,
            connection.clone(),
            self.reserved_ports.clone(),
        );
        log::info!(
            "Started '{}' kernel (pid {})",
            kernel_name,
            process
                .pid()
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| String::from("unknown"))
        );

        Ok(ProvisionedKernel {
            process: Box::new(process),
            connection,
            connection_file_path: Some(connection_path),
        })
    }
}
