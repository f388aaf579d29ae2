//
// kernel_process.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Ownership and monitoring of spawned kernel processes.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use event_listener::Event;
use tokio::io::{AsyncBufReadExt, AsyncRead};

use crate::connection_file::{ConnectionFile, ReservedPorts};

/// How long to wait for a killed kernel to exit.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// A handle to a running kernel. The session that owns the handle is the only
/// component allowed to signal the kernel.
#[async_trait]
pub trait KernelHandle: Send + Sync {
    /// The process ID of the kernel, if it is known.
    fn pid(&self) -> Option<u32>;

    /// Kill the kernel and wait for it to exit. Killing a kernel that has
    /// already exited succeeds.
    async fn kill(&self) -> Result<(), anyhow::Error>;
}

/// A kernel running as a child process of the gateway.
pub struct KernelProcess {
    /// A label for log messages (kernel name and PID)
    label: String,

    pid: Option<u32>,

    /// The exit code, once the process has exited
    exit_code: Arc<Mutex<Option<i32>>>,

    /// Fires when the process exits
    exit_event: Arc<Event>,

    /// The connection file the kernel was started with; its ports are
    /// released when the kernel is killed
    connection: ConnectionFile,

    reserved_ports: ReservedPorts,
}

impl KernelProcess {
    /// Take ownership of a freshly spawned child process and start monitoring
    /// it in the background.
    pub fn monitor(
        kernel_name: &str,
        mut child: tokio::process::Child,
        connection: ConnectionFile,
        reserved_ports: ReservedPorts,
    ) -> Self {
        let pid = child.id();
        let label = match pid {
            Some(pid) => format!("{} pid {}", kernel_name, pid),
            None => kernel_name.to_string(),
        };

        // Forward the kernel's standard streams to the log
        if let Some(stdout) = child.stdout.take() {
            Self::stream_output(stdout, "stdout", label.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            Self::stream_output(stderr, "stderr", label.clone());
        }

        let exit_code = Arc::new(Mutex::new(None));
        let exit_event = Arc::new(Event::new());

        let task_label = label.clone();
        let task_exit_code = exit_code.clone();
        let task_exit_event = exit_event.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    log::info!("[kernel {}] Process exited with status: {}", task_label, status);
                    status.code().unwrap_or(-1)
                }
                Err(e) => {
                    log::error!("[kernel {}] Failed to wait on process: {}", task_label, e);
                    -1
                }
            };
            *task_exit_code
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(code);
            task_exit_event.notify(usize::MAX);
        });

        Self {
            label,
            pid,
            exit_code,
            exit_event,
            connection,
            reserved_ports,
        }
    }

    /// The exit code of the process, or `None` if it is still running.
    pub fn exit_code(&self) -> Option<i32> {
        *self
            .exit_code
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn signal_kill(&self, pid: u32) -> Result<(), anyhow::Error> {
        use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

        let mut system = System::new();
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        match system.process(pid) {
            Some(process) => match process.kill_with(Signal::Kill) {
                Some(true) => Ok(()),
                Some(false) => Err(anyhow::anyhow!("Failed to send kill signal to {}", pid)),
                // The platform has no kill signal; fall back to the default
                None => {
                    if process.kill() {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!("Failed to kill process {}", pid))
                    }
                }
            },
            None => {
                // Already gone; the monitor task will record the exit.
                log::debug!("[kernel {}] Process not found when killing", self.label);
                Ok(())
            }
        }
    }

    /// Read lines from one of the kernel's standard streams and log them.
    fn stream_output<T: AsyncRead + Unpin + Send + 'static>(
        stream: T,
        kind: &'static str,
        label: String,
    ) {
        tokio::spawn(async move {
            let mut reader = tokio::io::BufReader::new(stream);
            let mut buffer = String::new();
            loop {
                buffer.clear();
                match reader.read_line(&mut buffer).await {
                    Ok(0) => {
                        log::trace!("[kernel {}] End of {}", label, kind);
                        break;
                    }
                    Ok(_) => {
                        log::debug!("[kernel {}] {}: {}", label, kind, buffer.trim_end());
                    }
                    Err(e) => {
                        log::error!("[kernel {}] Failed to read {}: {}", label, kind, e);
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl KernelHandle for KernelProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn kill(&self) -> Result<(), anyhow::Error> {
        // Listen before checking the exit code so an exit between the two
        // can't be missed.
        let listener = self.exit_event.listen();
        let result = if self.exit_code().is_some() {
            log::debug!("[kernel {}] Process already exited", self.label);
            Ok(())
        } else {
            match self.pid {
                Some(pid) => match self.signal_kill(pid) {
                    Ok(()) => match tokio::time::timeout(KILL_TIMEOUT, listener).await {
                        Ok(_) => Ok(()),
                        Err(_) => Err(anyhow::anyhow!(
                            "Kernel process {} did not exit within {} seconds of being killed",
                            pid,
                            KILL_TIMEOUT.as_secs()
                        )),
                    },
                    Err(e) => Err(e),
                },
                None => Err(anyhow::anyhow!("Kernel process has no process ID to kill")),
            }
        };

        self.reserved_ports.release(&self.connection);
        result
    }
}
