//
// config.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::path::PathBuf;
use std::time::Duration;

/// Settings for a running gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// The IP address the HTTP server binds to
    pub ip: String,

    /// The port the HTTP server binds to; 0 lets the OS pick one
    pub port: u16,

    /// The user name stamped into the header of messages the gateway creates
    pub username: String,

    /// Extra directories searched for kernelspecs, ahead of the standard
    /// Jupyter locations
    pub kernel_paths: Vec<PathBuf>,

    /// The directory kernel connection files are written to
    pub connection_dir: PathBuf,

    /// How long to wait for a `shutdown_reply` before tearing a session down
    /// anyway. `None` waits forever.
    pub shutdown_timeout: Option<Duration>,

    /// The value of the `Access-Control-Allow-Origin` response header
    pub cors_origin: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ip: String::from("127.0.0.1"),
            port: 8080,
            username: default_username(),
            kernel_paths: vec![],
            connection_dir: std::env::temp_dir(),
            shutdown_timeout: Some(Duration::from_secs(10)),
            cors_origin: String::from("*"),
        }
    }
}

impl GatewayConfig {
    /// The socket address string the HTTP server binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Derive the user name from the environment, the same way Jupyter clients do.
pub fn default_username() -> String {
    for var in ["LOGNAME", "USER", "LNAME", "USERNAME"] {
        if let Ok(name) = std::env::var(var) {
            if !name.is_empty() {
                return name;
            }
        }
    }
    String::from("kgserver")
}
