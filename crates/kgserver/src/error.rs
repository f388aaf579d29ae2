//
// error.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::fmt;

use hyper::StatusCode;
use kgshared::models;
use log::error;

#[derive(Debug)]
pub enum KGError {
    /// The kernel process could not be launched
    ProvisionFailed(String, anyhow::Error),
    SessionNotFound(String),
    SessionExists(String),
    /// One or more cleanup steps failed while tearing a session down
    TeardownFailed(String, Vec<anyhow::Error>),
    HandshakeTimeout(String, u64),
    ShutdownInProgress(String),
    /// The kernel answered the shutdown request with `restart: true`
    ShutdownDeclined(String),
    ChannelClosed(String, String),
    TransportFailed(String, anyhow::Error),
}

impl fmt::Display for KGError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error KG-{}: ", self.code())?;
        match self {
            KGError::ProvisionFailed(kernel_name, err) => {
                write!(f, "Failed to start kernel '{}': {}", kernel_name, err)
            }
            KGError::SessionNotFound(session_id) => {
                write!(f, "Session {} not found", session_id)
            }
            KGError::SessionExists(session_id) => {
                write!(f, "Session {} already exists", session_id)
            }
            KGError::TeardownFailed(session_id, errors) => {
                write!(
                    f,
                    "Failed to tear down session {} ({} step(s) failed): ",
                    session_id,
                    errors.len()
                )?;
                let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                write!(f, "{}", messages.join("; "))
            }
            KGError::HandshakeTimeout(session_id, seconds) => {
                write!(
                    f,
                    "Kernel for session {} did not reply to the shutdown request within {} seconds",
                    session_id, seconds
                )
            }
            KGError::ShutdownInProgress(session_id) => {
                write!(f, "Session {} is already shutting down", session_id)
            }
            KGError::ShutdownDeclined(session_id) => {
                write!(
                    f,
                    "Kernel for session {} replied that it will restart rather than stop",
                    session_id
                )
            }
            KGError::ChannelClosed(session_id, channel) => {
                write!(f, "The {} channel of session {} is closed", channel, session_id)
            }
            KGError::TransportFailed(session_id, err) => {
                write!(
                    f,
                    "Failed to connect to kernel channels for session {}: {}",
                    session_id, err
                )
            }
        }
    }
}

impl std::error::Error for KGError {}

impl KGError {
    fn code(&self) -> u8 {
        match self {
            KGError::ProvisionFailed(..) => 1,
            KGError::SessionNotFound(_) => 2,
            KGError::SessionExists(_) => 3,
            KGError::TeardownFailed(..) => 4,
            KGError::HandshakeTimeout(..) => 5,
            KGError::ShutdownInProgress(_) => 6,
            KGError::ShutdownDeclined(_) => 7,
            KGError::ChannelClosed(..) => 8,
            KGError::TransportFailed(..) => 9,
        }
    }

    /// The HTTP status used when this error is returned to a client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            KGError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            KGError::SessionExists(_)
            | KGError::ShutdownInProgress(_)
            | KGError::ShutdownDeclined(_) => StatusCode::CONFLICT,
            KGError::ChannelClosed(..) => StatusCode::GONE,
            KGError::HandshakeTimeout(..) => StatusCode::GATEWAY_TIMEOUT,
            KGError::ProvisionFailed(..)
            | KGError::TeardownFailed(..)
            | KGError::TransportFailed(..) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_json(&self, details: Option<String>) -> models::ErrorResponse {
        models::ErrorResponse {
            code: format!("KG-{}", self.code()),
            error: self.to_string(),
            details,
        }
    }

    pub fn log(&self) {
        error!("{}", self.to_string());
    }
}
