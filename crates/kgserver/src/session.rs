//
// session.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! A running kernel together with its four channels.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use kgshared::jupyter_message::JupyterChannel;
use kgshared::kernel_message::SessionState;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::channel_pair::ChannelPair;
use crate::envelope::EnvelopeBuilder;
use crate::error::KGError;
use crate::kernel_process::KernelHandle;
use crate::provisioner::ProvisionedKernel;
use crate::transport::KernelChannels;

pub struct Session {
    /// The session's unique ID
    pub id: String,

    /// The kernel type the session was started from
    pub kernel_name: String,

    /// When the session was created
    pub started: DateTime<Utc>,

    /// The kernel; only the session may kill it
    process: Box<dyn KernelHandle>,

    /// The connection file written for the kernel, removed at teardown
    connection_file_path: Option<PathBuf>,

    envelope: EnvelopeBuilder,

    shell: ChannelPair,
    stdin: ChannelPair,
    iopub: ChannelPair,
    control: ChannelPair,

    state: RwLock<SessionState>,

    /// Cancelled once teardown starts; every attachment watches it
    terminated: CancellationToken,

    /// Guards teardown so it runs at most once
    torn_down: AtomicBool,
}

impl Session {
    /// Assemble an active session from a provisioned kernel and its opened
    /// channels.
    pub fn new(
        id: String,
        kernel_name: String,
        username: String,
        kernel: ProvisionedKernel,
        channels: KernelChannels,
    ) -> Self {
        let terminated = CancellationToken::new();
        let pair = |endpoint| ChannelPair::new(&id, endpoint, terminated.clone());
        let shell = pair(channels.shell);
        let stdin = pair(channels.stdin);
        let iopub = pair(channels.iopub);
        let control = pair(channels.control);

        log::debug!(
            "[session {}] Session for '{}' kernel is active (pid {:?})",
            id,
            kernel_name,
            kernel.process.pid()
        );

        Self {
            envelope: EnvelopeBuilder::new(username, id.clone()),
            id,
            kernel_name,
            started: Utc::now(),
            process: kernel.process,
            connection_file_path: kernel.connection_file_path,
            shell,
            stdin,
            iopub,
            control,
            state: RwLock::new(SessionState::Active),
            terminated,
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn channel(&self, channel: JupyterChannel) -> &ChannelPair {
        match channel {
            JupyterChannel::Shell => &self.shell,
            JupyterChannel::Stdin => &self.stdin,
            JupyterChannel::IOPub => &self.iopub,
            JupyterChannel::Control => &self.control,
        }
    }

    pub fn shell(&self) -> &ChannelPair {
        &self.shell
    }

    pub fn channels(&self) -> [&ChannelPair; 4] {
        [&self.shell, &self.stdin, &self.iopub, &self.control]
    }

    pub fn envelope(&self) -> &EnvelopeBuilder {
        &self.envelope
    }

    /// How long the session has existed.
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Move from `Active` to `Terminating`. Fails if a shutdown is already
    /// under way or the session is gone.
    pub async fn begin_termination(&self) -> Result<(), KGError> {
        let mut state = self.state.write().await;
        match *state {
            SessionState::Active => {
                *state = SessionState::Terminating;
                log::debug!("[session {}] Terminating", self.id);
                Ok(())
            }
            SessionState::Spawning | SessionState::Terminating => {
                Err(KGError::ShutdownInProgress(self.id.clone()))
            }
            SessionState::Closed => Err(KGError::SessionNotFound(self.id.clone())),
        }
    }

    /// Return a `Terminating` session to `Active` after a shutdown that did
    /// not go through.
    pub async fn restore_active(&self) {
        let mut state = self.state.write().await;
        if *state == SessionState::Terminating {
            *state = SessionState::Active;
            log::debug!("[session {}] Active again", self.id);
        }
    }

    /// Tear the session down: signal attachments, kill the kernel, close all
    /// four channels and remove the connection file. Every step runs even if
    /// an earlier one fails; the failures are returned. Only the first call
    /// does anything.
    pub async fn close(&self) -> Vec<anyhow::Error> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return vec![];
        }
        log::debug!("[session {}] Tearing down", self.id);

        self.terminated.cancel();

        let mut errors = vec![];
        if let Err(e) = self.process.kill().await {
            log::error!("[session {}] Failed to kill kernel: {}", self.id, e);
            errors.push(e.context("Failed to kill kernel"));
        }

        for pair in self.channels() {
            pair.close();
        }

        if let Some(path) = &self.connection_file_path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::error!(
                        "[session {}] Failed to remove connection file {}: {}",
                        self.id,
                        path.display(),
                        e
                    );
                    errors.push(anyhow::anyhow!(
                        "Failed to remove connection file {}: {}",
                        path.display(),
                        e
                    ));
                }
            }
        }

        *self.state.write().await = SessionState::Closed;
        errors
    }
}
