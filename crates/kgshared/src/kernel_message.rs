//
// kernel_message.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use serde::{Deserialize, Serialize};

/// The lifecycle state of a kernel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// The kernel process is being launched. Sessions are only created once
    /// the kernel is running, so the gateway never reports a session in this
    /// state; it is part of the lifecycle clients may see from other servers.
    Spawning,
    /// The kernel is running and its channels accept connections
    Active,
    /// A shutdown request has been sent; waiting for the kernel's reply
    Terminating,
    /// The kernel and its channels have been torn down
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Spawning => "spawning",
            SessionState::Active => "active",
            SessionState::Terminating => "terminating",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Messages that are sent from the gateway to a connected client about the
/// session itself. For messages bridging the Jupyter protocol, see
/// `JupyterMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelMessage {
    /// The gateway is detaching the client from the channel; the connection
    /// will be closed after this message.
    Detached {
        /// Why the client was detached
        reason: String,
    },
}
