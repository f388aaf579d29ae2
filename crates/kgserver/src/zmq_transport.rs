//
// zmq_transport.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Kernel channels carried over ZeroMQ sockets.

use std::str::FromStr;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use hmac::Hmac;
use kgshared::jupyter_message::{JupyterChannel, JupyterMessage};
use sha2::Sha256;
use tokio::select;
use zeromq::{
    util::PeerIdentity, DealerSocket, Socket, SocketOptions, SocketRecv, SocketSend, SubSocket,
    ZmqMessage,
};

use crate::connection_file::ConnectionFile;
use crate::transport::{ChannelTransport, KernelChannels, KernelEndpoint};
use crate::wire_message::{hmac_key, WireMessage};

/// How long to keep trying to reach a kernel's socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connects to kernels over ZeroMQ: DEALER sockets for shell, stdin and
/// control, and a SUB socket for iopub.
#[derive(Debug, Default, Clone)]
pub struct ZmqTransport {}

impl ZmqTransport {
    pub fn new() -> Self {
        Self {}
    }

    /// Creates the socket options for DEALER sockets to set the peer identity
    /// to the session ID.
    fn dealer_peer_opts(session_id: &str) -> Result<SocketOptions, anyhow::Error> {
        let mut peer_opts = SocketOptions::default();
        let peer_id = PeerIdentity::from_str(session_id)
            .map_err(|e| anyhow::anyhow!("Invalid peer identity '{}': {}", session_id, e))?;
        peer_opts.peer_identity(peer_id);
        Ok(peer_opts)
    }

    async fn connect_socket<S: Socket>(
        session_id: &str,
        channel: JupyterChannel,
        socket: &mut S,
        endpoint: String,
    ) -> Result<(), anyhow::Error> {
        match tokio::time::timeout(CONNECT_TIMEOUT, socket.connect(endpoint.as_str())).await {
            Ok(Ok(())) => {
                log::trace!(
                    "[session {}] Connected to {} socket at {}",
                    session_id,
                    channel,
                    endpoint
                );
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::anyhow!(
                "Failed to connect to {} socket at {}: {}",
                channel,
                endpoint,
                e
            )),
            Err(_) => Err(anyhow::anyhow!(
                "Timed out connecting to {} socket at {}",
                channel,
                endpoint
            )),
        }
    }
}

#[async_trait]
impl ChannelTransport for ZmqTransport {
    async fn open(
        &self,
        session_id: &str,
        connection: &ConnectionFile,
    ) -> Result<KernelChannels, anyhow::Error> {
        let key = hmac_key(&connection.key)?;

        let mut shell = DealerSocket::with_options(Self::dealer_peer_opts(session_id)?);
        let mut stdin = DealerSocket::with_options(Self::dealer_peer_opts(session_id)?);
        let mut control = DealerSocket::with_options(Self::dealer_peer_opts(session_id)?);
        let mut iopub = SubSocket::new();

        Self::connect_socket(
            session_id,
            JupyterChannel::Shell,
            &mut shell,
            connection.endpoint(connection.shell_port),
        )
        .await?;
        Self::connect_socket(
            session_id,
            JupyterChannel::Stdin,
            &mut stdin,
            connection.endpoint(connection.stdin_port),
        )
        .await?;
        Self::connect_socket(
            session_id,
            JupyterChannel::Control,
            &mut control,
            connection.endpoint(connection.control_port),
        )
        .await?;
        Self::connect_socket(
            session_id,
            JupyterChannel::IOPub,
            &mut iopub,
            connection.endpoint(connection.iopub_port),
        )
        .await?;

        // Subscribe to all messages
        iopub.subscribe("").await?;

        Ok(KernelChannels {
            shell: spawn_bridge(session_id, JupyterChannel::Shell, Bridged::Dealer(shell), &key),
            stdin: spawn_bridge(session_id, JupyterChannel::Stdin, Bridged::Dealer(stdin), &key),
            iopub: spawn_bridge(session_id, JupyterChannel::IOPub, Bridged::Sub(iopub), &key),
            control: spawn_bridge(
                session_id,
                JupyterChannel::Control,
                Bridged::Dealer(control),
                &key,
            ),
        })
    }
}

/// A connected socket handed to a bridge task.
enum Bridged {
    Dealer(DealerSocket),
    Sub(SubSocket),
}

impl Bridged {
    async fn recv(&mut self) -> Result<ZmqMessage, zeromq::ZmqError> {
        match self {
            Bridged::Dealer(socket) => socket.recv().await,
            Bridged::Sub(socket) => socket.recv().await,
        }
    }

    /// Send a message to the kernel. iopub is receive-only, so anything sent
    /// there is dropped.
    async fn send(&mut self, message: ZmqMessage) -> Result<(), anyhow::Error> {
        match self {
            Bridged::Dealer(socket) => Ok(socket.send(message).await?),
            Bridged::Sub(_) => {
                anyhow::bail!("Messages cannot be sent to the kernel on iopub")
            }
        }
    }

    async fn close(self) {
        match self {
            Bridged::Dealer(socket) => {
                socket.close().await;
            }
            Bridged::Sub(socket) => {
                socket.close().await;
            }
        }
    }
}

/// Start a task that moves messages between a socket and a pair of queues,
/// and return the gateway's end of those queues.
fn spawn_bridge(
    session_id: &str,
    channel: JupyterChannel,
    socket: Bridged,
    key: &Option<Hmac<Sha256>>,
) -> KernelEndpoint {
    let (to_kernel_tx, to_kernel_rx) = async_channel::unbounded::<JupyterMessage>();
    let (from_kernel_tx, from_kernel_rx) = async_channel::unbounded::<JupyterMessage>();

    tokio::spawn(bridge(
        session_id.to_string(),
        channel,
        socket,
        key.clone(),
        to_kernel_rx,
        from_kernel_tx,
    ));

    KernelEndpoint {
        channel,
        to_kernel: to_kernel_tx,
        from_kernel: from_kernel_rx,
    }
}

async fn bridge(
    session_id: String,
    channel: JupyterChannel,
    mut socket: Bridged,
    key: Option<Hmac<Sha256>>,
    to_kernel: Receiver<JupyterMessage>,
    from_kernel: Sender<JupyterMessage>,
) {
    log::debug!("[session {}] Starting {} bridge", session_id, channel);
    loop {
        select! {
            zmq_msg = socket.recv() => {
                let zmq_msg = match zmq_msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::error!("[session {}] Failed to receive message from {} socket: {}", session_id, channel, e);
                        break;
                    }
                };
                let msg = match decode(zmq_msg, key.as_ref()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("[session {}] Dropping message from {} socket: {}", session_id, channel, e);
                        continue;
                    }
                };
                if from_kernel.send(msg).await.is_err() {
                    log::debug!("[session {}] {} queue closed", session_id, channel);
                    break;
                }
            },
            outbound = to_kernel.recv() => {
                let msg = match outbound {
                    Ok(msg) => msg,
                    Err(_) => {
                        log::debug!("[session {}] {} sender closed", session_id, channel);
                        break;
                    }
                };
                let msg_type = msg.header.msg_type.clone();
                let result = match WireMessage::from_jupyter(&msg, key.as_ref()).and_then(|wire| wire.into_zmq()) {
                    Ok(zmq_msg) => socket.send(zmq_msg).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    log::warn!("[session {}] Failed to send {} on {}: {}", session_id, msg_type, channel, e);
                }
            }
        }
    }

    to_kernel.close();
    from_kernel.close();
    socket.close().await;
    log::debug!("[session {}] Closed {} bridge", session_id, channel);
}

fn decode(
    message: ZmqMessage,
    key: Option<&Hmac<Sha256>>,
) -> Result<JupyterMessage, anyhow::Error> {
    let wire = WireMessage::from_zmq(message)?;
    wire.verify(key)?;
    wire.to_jupyter()
}
