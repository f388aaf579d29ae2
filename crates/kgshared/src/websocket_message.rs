//
// websocket_message.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use serde::{Deserialize, Serialize};

use crate::{jupyter_message::JupyterMessage, kernel_message::KernelMessage};

/// A message sent from the gateway over a channel's WebSocket connection. This
/// message can be either a Jupyter message emitted by the kernel or a kernel
/// message (sent from the gateway concerning the session itself).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WebsocketMessage {
    /// Kernel messages are messages about the session that are outside the
    /// bounds of the Jupyter protocol, such as forced detaches.
    #[serde(rename = "kernel")]
    Kernel(KernelMessage),

    /// Jupyter messages are passed through from the kernel unchanged.
    #[serde(rename = "jupyter")]
    Jupyter(JupyterMessage),
}
