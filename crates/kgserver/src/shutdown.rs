//
// shutdown.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! The `shutdown_request` / `shutdown_reply` handshake.

use std::time::Duration;

use kgshared::jupyter_message::JupyterMessage;

use crate::envelope::{is_child_message, EnvelopeBuilder};
use crate::error::KGError;
use crate::session::Session;

/// Builds a `shutdown_request` asking the kernel to stop for good.
pub fn shutdown_request(envelope: &EnvelopeBuilder) -> JupyterMessage {
    let mut request = envelope.build("shutdown_request");
    request.content = serde_json::json!({ "restart": false });
    request
}

/// Returns true if `reply` is the `shutdown_reply` to `request`.
pub fn is_shutdown_reply(request: &JupyterMessage, reply: &JupyterMessage) -> bool {
    reply.header.msg_type == "shutdown_reply" && is_child_message(request, reply)
}

/// Asks kernels to shut down and tears their sessions down once they agree.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    /// How long to wait for the reply; `None` waits forever
    timeout: Option<Duration>,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Give up on a handshake that could not be started. A closed shell
    /// channel means the kernel connection is gone, so the session is torn
    /// down; anything else leaves it `Active`.
    async fn abandon(session: &Session, error: KGError) -> KGError {
        match &error {
            KGError::ChannelClosed(..) => {
                log::warn!(
                    "[session {}] Shell channel is closed; tearing session down",
                    session.id
                );
                for e in session.close().await {
                    log::error!("[session {}] {}", session.id, e);
                }
            }
            _ => session.restore_active().await,
        }
        error
    }

    /// Run the handshake against `session` and, if the kernel agrees to stop,
    /// tear the session down.
    ///
    /// The session is left `Active` if the kernel replies that it will
    /// restart. If the shell channel is closed, before or during the
    /// handshake, the session is torn down and `ChannelClosed` is returned.
    /// If no reply arrives within the timeout the session is torn down anyway
    /// and `HandshakeTimeout` is returned.
    pub async fn shutdown(&self, session: &Session) -> Result<(), KGError> {
        session.begin_termination().await?;

        let request = shutdown_request(session.envelope());
        log::debug!(
            "[session {}] Sending shutdown_request {}",
            session.id,
            request.header.msg_id
        );

        // Listen for the reply before sending the request, so a fast kernel
        // can't answer before anyone is listening.
        let filter_request = request.clone();
        let replies = match session
            .shell()
            .subscribe(Box::new(move |msg| is_shutdown_reply(&filter_request, msg)))
        {
            Ok(replies) => replies,
            Err(e) => return Err(Self::abandon(session, e).await),
        };

        if let Err(e) = session.shell().send(request).await {
            drop(replies);
            return Err(Self::abandon(session, e).await);
        }

        let reply = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, replies.recv()).await {
                Ok(reply) => reply,
                Err(_) => {
                    log::warn!(
                        "[session {}] No shutdown_reply after {} seconds; forcing shutdown",
                        session.id,
                        timeout.as_secs()
                    );
                    drop(replies);
                    let errors = session.close().await;
                    for e in errors {
                        log::error!("[session {}] {}", session.id, e);
                    }
                    return Err(KGError::HandshakeTimeout(
                        session.id.clone(),
                        timeout.as_secs(),
                    ));
                }
            },
            None => replies.recv().await,
        };
        drop(replies);

        // The shell channel closed under us, either because the session was
        // torn down elsewhere or because the kernel connection died. Either
        // way the session can't be used again.
        let reply = match reply {
            Some(reply) => reply,
            None => {
                for e in session.close().await {
                    log::error!("[session {}] {}", session.id, e);
                }
                return Err(KGError::ChannelClosed(
                    session.id.clone(),
                    String::from("shell"),
                ));
            }
        };

        match reply.content.get("restart").and_then(|v| v.as_bool()) {
            Some(false) => {}
            Some(true) => {
                log::info!(
                    "[session {}] Kernel replied that it will restart; keeping session",
                    session.id
                );
                session.restore_active().await;
                return Err(KGError::ShutdownDeclined(session.id.clone()));
            }
            None => {
                log::warn!(
                    "[session {}] shutdown_reply has no boolean 'restart' field: {}",
                    session.id,
                    reply.content
                );
                session.restore_active().await;
                return Err(KGError::ShutdownDeclined(session.id.clone()));
            }
        }

        log::debug!("[session {}] Kernel agreed to shut down", session.id);
        let errors = session.close().await;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(KGError::TeardownFailed(session.id.clone(), errors))
        }
    }
}
