//
// jupyter_message.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The header of a Jupyter message.
///
/// Only `msg_id` and `msg_type` are required when a client sends a message;
/// the remaining fields default to empty strings so that loosely formed
/// client messages can still be routed to the kernel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JupyterMessageHeader {
    /// The message ID
    pub msg_id: String,

    /// The type of the message
    pub msg_type: String,

    /// The ID of the session that sent the message
    #[serde(default)]
    pub session: String,

    /// The name of the user that sent the message
    #[serde(default)]
    pub username: String,

    /// The date/time the message was created, as an ISO 8601 string
    #[serde(default)]
    pub date: String,

    /// The version of the Jupyter protocol
    #[serde(default)]
    pub version: String,
}

/// The set of Jupyter sockets ("channels") the gateway bridges. The heartbeat
/// channel is owned by the kernel connection and never exposed to clients.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JupyterChannel {
    /// The shell channel
    Shell,

    /// The stdin channel
    Stdin,

    /// The iopub channel
    IOPub,

    /// The control channel
    Control,
}

impl JupyterChannel {
    /// All bridged channels, in the order they are created.
    pub const ALL: [JupyterChannel; 4] = [
        JupyterChannel::Shell,
        JupyterChannel::Stdin,
        JupyterChannel::IOPub,
        JupyterChannel::Control,
    ];

    /// The lowercase name of the channel, as used in URLs.
    pub fn name(&self) -> &'static str {
        match self {
            JupyterChannel::Shell => "shell",
            JupyterChannel::Stdin => "stdin",
            JupyterChannel::IOPub => "iopub",
            JupyterChannel::Control => "control",
        }
    }

    /// Parse a channel from its lowercase name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "shell" => Some(JupyterChannel::Shell),
            "stdin" => Some(JupyterChannel::Stdin),
            "iopub" => Some(JupyterChannel::IOPub),
            "control" => Some(JupyterChannel::Control),
            _ => None,
        }
    }
}

impl std::fmt::Display for JupyterChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A Jupyter message envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JupyterMessage {
    /// The header of the message
    pub header: JupyterMessageHeader,

    /// The header of the message's parent (the message that caused this
    /// message). On the wire an absent parent is an empty object.
    #[serde(
        default,
        serialize_with = "serialize_parent_header",
        deserialize_with = "deserialize_parent_header"
    )]
    pub parent_header: Option<JupyterMessageHeader>,

    /// Additional metadata
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,

    /// The message payload
    #[serde(default = "empty_object")]
    pub content: serde_json::Value,

    /// The message buffers
    #[serde(default)]
    pub buffers: Vec<serde_json::Value>,
}

impl JupyterMessage {
    /// Returns true if this message is a reply to `request`, i.e. its parent
    /// header carries the request's message ID.
    pub fn is_reply_to(&self, request: &JupyterMessage) -> bool {
        match self.parent_header {
            Some(ref parent) => parent.msg_id == request.header.msg_id,
            None => false,
        }
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn serialize_parent_header<S>(
    parent: &Option<JupyterMessageHeader>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent {
        Some(header) => header.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

fn deserialize_parent_header<'de, D>(
    deserializer: D,
) -> Result<Option<JupyterMessageHeader>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(ref map) if map.is_empty() => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
