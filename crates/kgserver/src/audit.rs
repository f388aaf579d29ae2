//
// audit.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Audit records for session and connection lifecycle events.
//!
//! All records go to the `kgserver::audit` log target so that they can be
//! filtered or routed separately from diagnostic output.

use hyper::{Method, StatusCode};
use kgshared::jupyter_message::JupyterChannel;

const TARGET: &str = "kgserver::audit";

pub fn server_started(address: &str) {
    log::info!(target: TARGET, "Kernel gateway listening on {}", address);
}

pub fn session_started(session_id: &str, kernel_name: &str) {
    log::info!(
        target: TARGET,
        "Started '{}' kernel with session id {}",
        kernel_name,
        session_id
    );
}

pub fn session_stopped(session_id: &str, kernel_name: &str, uptime: chrono::Duration) {
    log::info!(
        target: TARGET,
        "Stopped '{}' kernel with session id {} after {} seconds",
        kernel_name,
        session_id,
        uptime.num_seconds()
    );
}

pub fn connection_attached(peer: &str, channel: JupyterChannel, session_id: &str) {
    log::info!(
        target: TARGET,
        "{} connected to {} channel of session {}",
        peer,
        channel,
        session_id
    );
}

pub fn connection_detached(peer: &str, channel: JupyterChannel, session_id: &str) {
    log::info!(
        target: TARGET,
        "{} disconnected from {} channel of session {}",
        peer,
        channel,
        session_id
    );
}

/// Record an HTTP request in (roughly) the combined log format.
pub fn request(peer: &str, method: &Method, path: &str, status: StatusCode, user_agent: &str) {
    log::info!(
        target: TARGET,
        "{} - - [{}] \"{} {} HTTP/1.1\" {} - \"-\" \"{}\"",
        peer,
        chrono::Utc::now().format("%d/%b/%Y:%H:%M:%S %z"),
        method,
        path,
        status.as_u16(),
        user_agent
    );
}
