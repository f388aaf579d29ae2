//
// mod.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! In-memory stand-ins for kernels, shared by the gateway tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use kgserver::config::GatewayConfig;
use kgserver::connection_file::ConnectionFile;
use kgserver::error::KGError;
use kgserver::gateway::Gateway;
use kgserver::kernel_catalog::KernelCatalog;
use kgserver::kernel_process::KernelHandle;
use kgserver::provisioner::{KernelProvisioner, ProvisionedKernel};
use kgserver::session::Session;
use kgserver::transport::{ChannelTransport, KernelChannels, KernelEndpoint};
use kgshared::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};
use kgshared::kernel_spec::{KernelSpec, KernelSpecEntry};

/// How long tests wait for something that should happen promptly.
pub const WAIT: Duration = Duration::from_secs(5);

/// The kernel's end of one channel.
#[derive(Clone)]
pub struct FakeKernelChannel {
    /// Messages the gateway sent to the kernel
    pub incoming: Receiver<JupyterMessage>,

    /// Messages the kernel emits
    pub outgoing: Sender<JupyterMessage>,
}

impl FakeKernelChannel {
    /// Emit a message from the kernel.
    pub async fn emit(&self, msg: JupyterMessage) {
        self.outgoing.send(msg).await.expect("channel closed");
    }

    /// The next message the gateway sent to the kernel.
    pub async fn next(&self) -> JupyterMessage {
        tokio::time::timeout(WAIT, self.incoming.recv())
            .await
            .expect("timed out waiting for a message to the kernel")
            .expect("channel closed")
    }
}

/// The kernel's ends of all four channels.
#[derive(Clone)]
pub struct FakeKernel {
    pub shell: FakeKernelChannel,
    pub stdin: FakeKernelChannel,
    pub iopub: FakeKernelChannel,
    pub control: FakeKernelChannel,
}

impl FakeKernel {
    /// Answer the next `shutdown_request` on shell with a `shutdown_reply`.
    pub fn reply_to_shutdown(&self, restart: bool) -> tokio::task::JoinHandle<JupyterMessage> {
        let shell = self.shell.clone();
        tokio::spawn(async move {
            loop {
                let request = shell.next().await;
                if request.header.msg_type == "shutdown_request" {
                    let reply = reply_to(
                        &request,
                        "shutdown_reply",
                        serde_json::json!({ "status": "ok", "restart": restart }),
                    );
                    shell.emit(reply).await;
                    return request;
                }
            }
        })
    }
}

/// Create both ends of an in-memory channel.
pub fn endpoint_pair(channel: JupyterChannel) -> (KernelEndpoint, FakeKernelChannel) {
    let (to_kernel_tx, to_kernel_rx) = async_channel::unbounded();
    let (from_kernel_tx, from_kernel_rx) = async_channel::unbounded();
    (
        KernelEndpoint {
            channel,
            to_kernel: to_kernel_tx,
            from_kernel: from_kernel_rx,
        },
        FakeKernelChannel {
            incoming: to_kernel_rx,
            outgoing: from_kernel_tx,
        },
    )
}

pub fn fake_channels() -> (KernelChannels, FakeKernel) {
    let (shell, shell_kernel) = endpoint_pair(JupyterChannel::Shell);
    let (stdin, stdin_kernel) = endpoint_pair(JupyterChannel::Stdin);
    let (iopub, iopub_kernel) = endpoint_pair(JupyterChannel::IOPub);
    let (control, control_kernel) = endpoint_pair(JupyterChannel::Control);
    (
        KernelChannels {
            shell,
            stdin,
            iopub,
            control,
        },
        FakeKernel {
            shell: shell_kernel,
            stdin: stdin_kernel,
            iopub: iopub_kernel,
            control: control_kernel,
        },
    )
}

/// A message as the kernel would emit it.
pub fn kernel_message(msg_type: &str, content: serde_json::Value) -> JupyterMessage {
    JupyterMessage {
        header: JupyterMessageHeader {
            msg_id: uuid::Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            session: String::from("kernel"),
            username: String::from("kernel"),
            date: String::from("2025-01-01T00:00:00.000Z"),
            version: String::from("5.3"),
        },
        parent_header: None,
        metadata: serde_json::json!({}),
        content,
        buffers: vec![],
    }
}

pub fn reply_to(request: &JupyterMessage, msg_type: &str, content: serde_json::Value) -> JupyterMessage {
    let mut reply = kernel_message(msg_type, content);
    reply.parent_header = Some(request.header.clone());
    reply
}

/// Records what happens to a fake kernel process.
#[derive(Default)]
pub struct KillLog {
    pub kills: AtomicUsize,
}

pub struct FakeHandle {
    log: Arc<KillLog>,
    fail: bool,
}

#[async_trait]
impl KernelHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn kill(&self) -> Result<(), anyhow::Error> {
        self.log.kills.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("kill refused")
        }
        Ok(())
    }
}

pub fn fake_connection() -> ConnectionFile {
    ConnectionFile {
        control_port: 1,
        shell_port: 2,
        stdin_port: 3,
        iopub_port: 4,
        hb_port: 5,
        transport: String::from("tcp"),
        signature_scheme: String::from("hmac-sha256"),
        ip: String::from("127.0.0.1"),
        key: String::new(),
    }
}

/// Launches fake kernels for the kernel types it knows.
pub struct FakeProvisioner {
    kernels: Vec<String>,
    pub launches: AtomicUsize,
    pub kill_log: Arc<KillLog>,
    pub fail_kill: AtomicBool,
}

impl FakeProvisioner {
    pub fn new(kernels: &[&str]) -> Self {
        Self {
            kernels: kernels.iter().map(|k| k.to_string()).collect(),
            launches: AtomicUsize::new(0),
            kill_log: Arc::new(KillLog::default()),
            fail_kill: AtomicBool::new(false),
        }
    }

    pub fn kills(&self) -> usize {
        self.kill_log.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KernelProvisioner for FakeProvisioner {
    async fn launch(&self, kernel_name: &str) -> Result<ProvisionedKernel, KGError> {
        if !self.kernels.iter().any(|k| k == kernel_name) {
            return Err(KGError::ProvisionFailed(
                kernel_name.to_string(),
                anyhow::anyhow!("No kernel named '{}' is installed", kernel_name),
            ));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(ProvisionedKernel {
            process: Box::new(FakeHandle {
                log: self.kill_log.clone(),
                fail: self.fail_kill.load(Ordering::SeqCst),
            }),
            connection: fake_connection(),
            connection_file_path: None,
        })
    }
}

/// Hands out in-memory channels and keeps the kernel ends for the test.
#[derive(Default)]
pub struct InMemoryTransport {
    kernels: Mutex<HashMap<String, FakeKernel>>,
    pub fail: AtomicBool,
}

impl InMemoryTransport {
    /// The fake kernel behind a session.
    pub fn kernel(&self, session_id: &str) -> FakeKernel {
        self.kernels
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .expect("no kernel for session")
    }
}

#[async_trait]
impl ChannelTransport for InMemoryTransport {
    async fn open(
        &self,
        session_id: &str,
        _connection: &ConnectionFile,
    ) -> Result<KernelChannels, anyhow::Error> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let (channels, kernel) = fake_channels();
        self.kernels
            .lock()
            .unwrap()
            .insert(session_id.to_string(), kernel);
        Ok(channels)
    }
}

/// A catalog with a fixed set of kernel types.
pub struct FixedCatalog {
    entries: HashMap<String, KernelSpecEntry>,
}

impl FixedCatalog {
    pub fn new(names: &[&str]) -> Self {
        let entries = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    KernelSpecEntry {
                        name: name.to_string(),
                        resource_dir: format!("/kernels/{}", name),
                        spec: KernelSpec {
                            argv: vec![String::from(*name), String::from("{connection_file}")],
                            display_name: name.to_uppercase(),
                            language: String::from("python"),
                            env: HashMap::new(),
                            interrupt_mode: None,
                            metadata: None,
                        },
                    },
                )
            })
            .collect();
        Self { entries }
    }
}

#[async_trait]
impl KernelCatalog for FixedCatalog {
    async fn find_all(&self) -> HashMap<String, KernelSpecEntry> {
        self.entries.clone()
    }
}

pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub provisioner: Arc<FakeProvisioner>,
    pub transport: Arc<InMemoryTransport>,
}

/// A gateway backed by fakes that knows the `python3` and `ir` kernels.
pub fn test_gateway(shutdown_timeout: Option<Duration>) -> TestGateway {
    let config = GatewayConfig {
        port: 0,
        username: String::from("tester"),
        shutdown_timeout,
        ..GatewayConfig::default()
    };
    let provisioner = Arc::new(FakeProvisioner::new(&["python3", "ir"]));
    let transport = Arc::new(InMemoryTransport::default());
    let gateway = Arc::new(Gateway::new(
        config,
        Arc::new(FixedCatalog::new(&["python3", "ir"])),
        provisioner.clone(),
        transport.clone(),
    ));
    TestGateway {
        gateway,
        provisioner,
        transport,
    }
}

/// A standalone session over fake channels.
pub fn test_session(id: &str) -> (Arc<Session>, FakeKernel, Arc<KillLog>) {
    let kill_log = Arc::new(KillLog::default());
    let (channels, kernel) = fake_channels();
    let session = Session::new(
        id.to_string(),
        String::from("python3"),
        String::from("tester"),
        ProvisionedKernel {
            process: Box::new(FakeHandle {
                log: kill_log.clone(),
                fail: false,
            }),
            connection: fake_connection(),
            connection_file_path: None,
        },
        channels,
    );
    (Arc::new(session), kernel, kill_log)
}

/// Wait for a receive that should complete promptly.
pub async fn recv_soon<F, T>(future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}
