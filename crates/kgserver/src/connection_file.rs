//
// connection_file.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// The contents of the Connection File as listed in the Jupyter specification;
/// directly parsed from JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionFile {
    /// ZeroMQ port: Control channel (kernel interrupts)
    pub control_port: u16,

    /// ZeroMQ port: Shell channel (execution, completion)
    pub shell_port: u16,

    /// ZeroMQ port: Standard input channel (prompts)
    pub stdin_port: u16,

    /// ZeroMQ port: IOPub channel (broadcasts input/output)
    pub iopub_port: u16,

    /// ZeroMQ port: Heartbeat messages (echo)
    pub hb_port: u16,

    /// The transport type to use for ZeroMQ; generally "tcp"
    pub transport: String,

    /// The signature scheme to use for messages; generally "hmac-sha256"
    pub signature_scheme: String,

    /// The IP address the kernel binds to
    pub ip: String,

    /// The HMAC-256 signing key, or an empty string for an unauthenticated
    /// connection
    pub key: String,
}

/// Ports handed out to kernels that are starting or running. Shared between
/// all launches so that two kernels starting at once never pick the same port.
#[derive(Debug, Clone, Default)]
pub struct ReservedPorts {
    ports: Arc<Mutex<HashSet<u16>>>,
}

impl ReservedPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a port; returns false if it was already reserved.
    fn reserve(&self, port: u16) -> bool {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports.insert(port)
    }

    /// Release all ports used by a connection file.
    pub fn release(&self, connection: &ConnectionFile) {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        for port in connection.ports() {
            ports.remove(&port);
        }
        log::trace!("Released kernel ports; {} ports remain reserved", ports.len());
    }

    pub fn len(&self) -> usize {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConnectionFile {
    /// Create a ConnectionFile by parsing the contents of a connection file.
    pub fn from_file<P: AsRef<Path>>(connection_file: P) -> Result<Self, anyhow::Error> {
        let file = File::open(connection_file)?;
        let reader = BufReader::new(file);
        let info = serde_json::from_reader(reader)?;
        Ok(info)
    }

    pub fn to_file<P: AsRef<Path>>(&self, connection_file: P) -> Result<(), anyhow::Error> {
        let file = File::create(connection_file)?;
        serde_json::to_writer_pretty(file, &self)?;
        Ok(())
    }

    /// Find a free port that is not in the reserved list, and reserve it.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the port to find. This is used for logging.
    /// * `reserved_ports` - The ports already handed out to other kernels.
    fn find_port(name: &str, reserved_ports: &ReservedPorts) -> Result<u16, anyhow::Error> {
        // Picking from a large range makes collisions with reserved ports
        // rare; ten in a row means something is wrong.
        for attempt in 1..=10 {
            let candidate = match portpicker::pick_unused_port() {
                Some(port) => port,
                None => {
                    return Err(anyhow::anyhow!(
                        "Failed to pick {} port; no free ports available or port range exhausted",
                        name
                    ));
                }
            };

            if reserved_ports.reserve(candidate) {
                log::trace!("Picked {} port: {}", name, candidate);
                return Ok(candidate);
            }

            log::trace!(
                "Port {} is reserved; trying again (attempt {})",
                candidate,
                attempt
            );
        }

        Err(anyhow::anyhow!(
            "Failed to pick unreserved {} port after 10 tries",
            name
        ))
    }

    /// Generate a new ConnectionFile by picking free ports and a random
    /// signing key.
    ///
    /// # Arguments
    ///
    /// * `ip` - The IP address the kernel should bind to
    /// * `reserved_ports` - Ports that must not be used. Every port picked
    ///   here is added to the set; on failure, the ones picked so far are
    ///   released again.
    pub fn generate(ip: String, reserved_ports: &ReservedPorts) -> Result<Self, anyhow::Error> {
        use rand::Rng;

        let key_bytes = rand::thread_rng().gen::<[u8; 16]>();
        let key = hex::encode(key_bytes);

        let mut picked: Vec<u16> = Vec::with_capacity(5);
        for name in ["control", "shell", "iopub", "heartbeat", "stdin"] {
            match ConnectionFile::find_port(name, reserved_ports) {
                Ok(port) => picked.push(port),
                Err(e) => {
                    let mut ports = reserved_ports
                        .ports
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    for port in picked {
                        ports.remove(&port);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            control_port: picked[0],
            shell_port: picked[1],
            iopub_port: picked[2],
            hb_port: picked[3],
            stdin_port: picked[4],
            transport: "tcp".to_string(),
            signature_scheme: "hmac-sha256".to_string(),
            key,
            ip,
        })
    }

    /// All five ports named by this connection file.
    pub fn ports(&self) -> [u16; 5] {
        [
            self.control_port,
            self.shell_port,
            self.stdin_port,
            self.iopub_port,
            self.hb_port,
        ]
    }

    /// Given a port, return a URI-like string that can be used to connect to
    /// the port, given the other parameters in the connection file.
    ///
    /// Example: `32` => `"tcp://127.0.0.1:32"`
    pub fn endpoint(&self, port: u16) -> String {
        format!("{}://{}:{}", self.transport, self.ip, port)
    }
}
