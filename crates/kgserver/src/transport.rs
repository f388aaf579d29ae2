//
// transport.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! The connection between the gateway and a running kernel's four channels.

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use kgshared::jupyter_message::{JupyterChannel, JupyterMessage};

use crate::connection_file::ConnectionFile;

/// The gateway's end of one kernel channel.
///
/// Messages sent on `to_kernel` are delivered to the kernel; messages the
/// kernel emits arrive on `from_kernel`, in order. Closing either queue tears
/// down the underlying connection, after which `from_kernel` reports closed.
#[derive(Debug, Clone)]
pub struct KernelEndpoint {
    pub channel: JupyterChannel,
    pub to_kernel: Sender<JupyterMessage>,
    pub from_kernel: Receiver<JupyterMessage>,
}

impl KernelEndpoint {
    /// Close both directions of the endpoint.
    pub fn close(&self) {
        self.to_kernel.close();
        self.from_kernel.close();
    }
}

/// The gateway's ends of all four channels of a kernel.
#[derive(Debug, Clone)]
pub struct KernelChannels {
    pub shell: KernelEndpoint,
    pub stdin: KernelEndpoint,
    pub iopub: KernelEndpoint,
    pub control: KernelEndpoint,
}

/// Opens the channels of a freshly provisioned kernel.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Connect to all four channels of the kernel described by `connection`,
    /// identifying as `session_id`.
    async fn open(
        &self,
        session_id: &str,
        connection: &ConnectionFile,
    ) -> Result<KernelChannels, anyhow::Error>;
}
