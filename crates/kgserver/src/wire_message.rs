//
// wire_message.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use bytes::Bytes;
use hmac::{Hmac, Mac};
use kgshared::jupyter_message::{JupyterMessage, JupyterMessageHeader};
use sha2::Sha256;
use zeromq::ZmqMessage;

/// Separates routing identities from the message body.
const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Create the HMAC signer for a connection key; an empty key means messages
/// are not signed.
pub fn hmac_key(key: &str) -> Result<Option<Hmac<Sha256>>, anyhow::Error> {
    if key.is_empty() {
        return Ok(None);
    }
    Ok(Some(Hmac::<Sha256>::new_from_slice(key.as_bytes())?))
}

/// A Jupyter message as it travels over a ZeroMQ socket.
#[derive(Debug, Clone)]
pub struct WireMessage {
    /// Any routing identities that preceded the delimiter
    pub identities: Vec<Vec<u8>>,

    /// The hex HMAC signature of the header, parent header, metadata and
    /// content parts; empty when messages are not signed
    pub signature: Vec<u8>,

    /// The four JSON parts: header, parent header, metadata, content
    pub parts: [Vec<u8>; 4],

    /// Raw binary buffers following the JSON parts
    pub buffers: Vec<Vec<u8>>,
}

impl WireMessage {
    /// Create a new wire message from a Jupyter message, signing it with the
    /// given key.
    pub fn from_jupyter(
        msg: &JupyterMessage,
        hmac_key: Option<&Hmac<Sha256>>,
    ) -> Result<Self, anyhow::Error> {
        let parent_header = match msg.parent_header {
            Some(ref parent) => serde_json::to_vec(parent)?,
            None => serde_json::to_vec(&serde_json::Map::new())?,
        };
        let parts = [
            serde_json::to_vec(&msg.header)?,
            parent_header,
            serde_json::to_vec(&msg.metadata)?,
            serde_json::to_vec(&msg.content)?,
        ];

        let buffers = msg
            .buffers
            .iter()
            .map(buffer_to_bytes)
            .collect::<Result<Vec<_>, _>>()?;

        let signature = match hmac_key {
            Some(key) => hex::encode(sign(key, &parts)).into_bytes(),
            None => vec![],
        };

        Ok(WireMessage {
            identities: vec![],
            signature,
            parts,
            buffers,
        })
    }

    /// Split the frames of a ZeroMQ message into a wire message.
    pub fn from_zmq(message: ZmqMessage) -> Result<Self, anyhow::Error> {
        let frames: Vec<Bytes> = message.into_vec();
        let delimiter = match frames.iter().position(|frame| frame.as_ref() == DELIMITER) {
            Some(index) => index,
            None => anyhow::bail!("Message has no <IDS|MSG> delimiter"),
        };

        let identities = frames[..delimiter].iter().map(|f| f.to_vec()).collect();
        let body = &frames[delimiter + 1..];
        if body.len() < 5 {
            anyhow::bail!(
                "Message has {} parts after the delimiter; expected at least 5",
                body.len()
            );
        }

        Ok(WireMessage {
            identities,
            signature: body[0].to_vec(),
            parts: [
                body[1].to_vec(),
                body[2].to_vec(),
                body[3].to_vec(),
                body[4].to_vec(),
            ],
            buffers: body[5..].iter().map(|f| f.to_vec()).collect(),
        })
    }

    /// Check the message signature against the given key.
    pub fn verify(&self, hmac_key: Option<&Hmac<Sha256>>) -> Result<(), anyhow::Error> {
        let key = match hmac_key {
            Some(key) => key,
            None => return Ok(()),
        };
        let expected = hex::decode(&self.signature)
            .map_err(|e| anyhow::anyhow!("Message signature is not valid hex: {}", e))?;
        let mut mac = key.clone();
        for part in &self.parts {
            mac.update(part);
        }
        mac.verify_slice(&expected)
            .map_err(|_| anyhow::anyhow!("Message signature does not match"))
    }

    /// Convert the message into a Jupyter message; fails if any of the JSON
    /// parts cannot be parsed.
    pub fn to_jupyter(&self) -> Result<JupyterMessage, anyhow::Error> {
        let header: JupyterMessageHeader = serde_json::from_slice(&self.parts[0])?;
        let parent: serde_json::Value = serde_json::from_slice(&self.parts[1])?;
        let parent_header = match parent {
            serde_json::Value::Object(ref map) if map.is_empty() => None,
            serde_json::Value::Null => None,
            other => Some(serde_json::from_value::<JupyterMessageHeader>(other)?),
        };
        let metadata = serde_json::from_slice(&self.parts[2])?;
        let content = serde_json::from_slice(&self.parts[3])?;
        let buffers = self
            .buffers
            .iter()
            .map(|buffer| serde_json::Value::from(buffer.clone()))
            .collect();

        Ok(JupyterMessage {
            header,
            parent_header,
            metadata,
            content,
            buffers,
        })
    }

    /// Assemble the frames of a ZeroMQ message.
    pub fn into_zmq(self) -> Result<ZmqMessage, anyhow::Error> {
        let mut frames: Vec<Bytes> = Vec::with_capacity(self.identities.len() + 6);
        frames.extend(self.identities.into_iter().map(Bytes::from));
        frames.push(Bytes::from_static(DELIMITER));
        frames.push(Bytes::from(self.signature));
        frames.extend(self.parts.into_iter().map(Bytes::from));
        frames.extend(self.buffers.into_iter().map(Bytes::from));
        ZmqMessage::try_from(frames).map_err(|e| anyhow::anyhow!("Invalid ZeroMQ message: {}", e))
    }
}

fn sign(key: &Hmac<Sha256>, parts: &[Vec<u8>; 4]) -> Vec<u8> {
    let mut mac = key.clone();
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// Buffers arrive from clients as JSON; strings are sent as their UTF-8 bytes
/// and arrays of numbers as raw bytes.
fn buffer_to_bytes(buffer: &serde_json::Value) -> Result<Vec<u8>, anyhow::Error> {
    match buffer {
        serde_json::Value::String(s) => Ok(s.as_bytes().to_vec()),
        serde_json::Value::Array(values) => values
            .iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| anyhow::anyhow!("Buffer element {} is not a byte", v))
            })
            .collect(),
        other => Ok(serde_json::to_vec(other)?),
    }
}
