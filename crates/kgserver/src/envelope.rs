//
// envelope.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Construction and correlation of Jupyter message envelopes.

use kgshared::jupyter_message::{JupyterMessage, JupyterMessageHeader};

/// The Jupyter protocol version stamped on messages the gateway creates.
pub const PROTOCOL_VERSION: &str = "5.0";

/// Builds request envelopes on behalf of a single session.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    /// The user name placed in every header
    username: String,

    /// The session ID placed in every header
    session_id: String,
}

impl EnvelopeBuilder {
    pub fn new(username: String, session_id: String) -> Self {
        Self {
            username,
            session_id,
        }
    }

    /// Create a fresh envelope of the given type, with a new message ID, the
    /// current time, and empty metadata, content and parent header. Callers
    /// fill in `content` afterwards.
    pub fn build(&self, msg_type: &str) -> JupyterMessage {
        JupyterMessage {
            header: JupyterMessageHeader {
                msg_id: make_message_id(),
                msg_type: msg_type.to_string(),
                session: self.session_id.clone(),
                username: self.username.clone(),
                date: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: None,
            metadata: serde_json::json!({}),
            content: serde_json::json!({}),
            buffers: vec![],
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Returns true if `reply` was sent in response to `request`.
pub fn is_child_message(request: &JupyterMessage, reply: &JupyterMessage) -> bool {
    reply.is_reply_to(request)
}

/// Generate a unique ID for a Jupyter message.
pub fn make_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
