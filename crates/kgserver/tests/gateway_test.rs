//
// gateway_test.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Session creation, attachment and the shutdown handshake, against fake
//! kernels.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{kernel_message, recv_soon, reply_to, test_gateway, WAIT};
use kgserver::error::KGError;
use kgshared::jupyter_message::JupyterChannel;
use kgshared::kernel_message::SessionState;

#[tokio::test]
async fn test_python_session_lifecycle() {
    let t = test_gateway(Some(WAIT));
    let id = t.gateway.create_session("python3").await.unwrap();
    assert!(t.gateway.list_sessions().await.contains(&id));

    let kernel = t.transport.kernel(&id);
    let first = t
        .gateway
        .attach(&id, JupyterChannel::IOPub, "client-1")
        .await
        .unwrap();
    let second = t
        .gateway
        .attach(&id, JupyterChannel::IOPub, "client-2")
        .await
        .unwrap();

    let hello = kernel_message("stream", serde_json::json!({ "name": "stdout", "text": "hello" }));
    kernel.iopub.emit(hello.clone()).await;
    assert_eq!(recv_soon(first.recv()).await.unwrap(), hello);
    assert_eq!(recv_soon(second.recv()).await.unwrap(), hello);

    let replier = kernel.reply_to_shutdown(false);
    t.gateway.terminate_session(&id).await.unwrap();

    // The request carried the session's identity
    let request = replier.await.unwrap();
    assert_eq!(request.header.session, id);
    assert_eq!(request.header.username, "tester");
    assert_eq!(request.content["restart"], serde_json::json!(false));

    assert!(!t.gateway.list_sessions().await.contains(&id));
    assert!(recv_soon(first.recv()).await.is_none());
    assert!(recv_soon(second.recv()).await.is_none());
    assert!(first.is_terminated());
    assert_eq!(t.provisioner.kills(), 1);
}

#[tokio::test]
async fn test_session_ids_are_unique() {
    let t = test_gateway(Some(WAIT));
    let a = t.gateway.create_session("python3").await.unwrap();
    let b = t.gateway.create_session("python3").await.unwrap();
    let c = t.gateway.create_session("ir").await.unwrap();
    assert_ne!(a, b);
    assert_ne!(b, c);
    assert_ne!(a, c);
    assert_eq!(t.gateway.list_sessions().await.len(), 3);

    let session = t.gateway.registry().get(&a).await.unwrap();
    assert_eq!(session.state().await, SessionState::Active);
    assert_eq!(session.kernel_name, "python3");
    for pair in session.channels() {
        assert!(!pair.is_closed());
    }
}

#[tokio::test]
async fn test_terminate_unknown_session() {
    let t = test_gateway(Some(WAIT));
    let id = t.gateway.create_session("python3").await.unwrap();

    let result = t.gateway.terminate_session("no-such-id").await;
    assert!(matches!(result, Err(KGError::SessionNotFound(ref s)) if s == "no-such-id"));
    assert_eq!(t.gateway.list_sessions().await, vec![id]);
    assert_eq!(t.provisioner.kills(), 0);
}

#[tokio::test]
async fn test_unknown_kernel_type_creates_nothing() {
    let t = test_gateway(Some(WAIT));
    let result = t.gateway.create_session("cobol").await;
    match result {
        Err(e) => {
            assert!(matches!(e, KGError::ProvisionFailed(ref k, _) if k == "cobol"));
            assert_eq!(e.status_code(), hyper::StatusCode::INTERNAL_SERVER_ERROR);
        }
        Ok(id) => panic!("unexpected session {}", id),
    }
    assert!(t.gateway.list_sessions().await.is_empty());
}

#[tokio::test]
async fn test_transport_failure_kills_the_kernel() {
    let t = test_gateway(Some(WAIT));
    t.transport.fail.store(true, Ordering::SeqCst);
    let result = t.gateway.create_session("python3").await;
    assert!(matches!(result, Err(KGError::TransportFailed(..))));
    assert!(t.gateway.list_sessions().await.is_empty());
    assert_eq!(t.provisioner.kills(), 1);
}

#[tokio::test]
async fn test_restart_reply_keeps_the_session() {
    let t = test_gateway(Some(WAIT));
    let id = t.gateway.create_session("python3").await.unwrap();
    let kernel = t.transport.kernel(&id);

    let replier = kernel.reply_to_shutdown(true);
    let result = t.gateway.terminate_session(&id).await;
    assert!(matches!(result, Err(KGError::ShutdownDeclined(_))));
    replier.await.unwrap();

    let session = t.gateway.registry().get(&id).await.unwrap();
    assert_eq!(session.state().await, SessionState::Active);
    assert!(!session.shell().is_closed());
    assert_eq!(t.provisioner.kills(), 0);

    // A later shutdown can still succeed
    let replier = kernel.reply_to_shutdown(false);
    t.gateway.terminate_session(&id).await.unwrap();
    replier.await.unwrap();
    assert!(t.gateway.list_sessions().await.is_empty());
}

#[tokio::test]
async fn test_unrelated_replies_are_ignored() {
    let t = test_gateway(Some(WAIT));
    let id = t.gateway.create_session("python3").await.unwrap();
    let kernel = t.transport.kernel(&id);
    let session = t.gateway.registry().get(&id).await.unwrap();

    let gateway = t.gateway.clone();
    let terminate = tokio::spawn({
        let id = id.clone();
        async move { gateway.terminate_session(&id).await }
    });

    let request = kernel.shell.next().await;
    assert_eq!(request.header.msg_type, "shutdown_request");
    assert_eq!(session.state().await, SessionState::Terminating);

    // A shutdown_reply to some other request, and another reply to ours
    let stranger = kernel_message("shutdown_request", serde_json::json!({}));
    kernel
        .shell
        .emit(reply_to(&stranger, "shutdown_reply", serde_json::json!({ "restart": false })))
        .await;
    kernel
        .shell
        .emit(reply_to(&request, "status", serde_json::json!({ "execution_state": "busy" })))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!terminate.is_finished());
    assert_eq!(session.state().await, SessionState::Terminating);

    kernel
        .shell
        .emit(reply_to(&request, "shutdown_reply", serde_json::json!({ "restart": false })))
        .await;
    recv_soon(terminate).await.unwrap().unwrap();
    assert_eq!(session.state().await, SessionState::Closed);
    assert!(t.gateway.list_sessions().await.is_empty());
}

#[tokio::test]
async fn test_second_terminate_while_pending() {
    let t = test_gateway(Some(WAIT));
    let id = t.gateway.create_session("python3").await.unwrap();
    let kernel = t.transport.kernel(&id);

    let gateway = t.gateway.clone();
    let first = tokio::spawn({
        let id = id.clone();
        async move { gateway.terminate_session(&id).await }
    });
    let request = kernel.shell.next().await;

    let second = t.gateway.terminate_session(&id).await;
    assert!(matches!(second, Err(KGError::ShutdownInProgress(_))));
    // Still registered while the first shutdown is pending
    assert!(t.gateway.list_sessions().await.contains(&id));
    // No second request was sent
    assert!(kernel.shell.incoming.is_empty());

    kernel
        .shell
        .emit(reply_to(&request, "shutdown_reply", serde_json::json!({ "restart": false })))
        .await;
    recv_soon(first).await.unwrap().unwrap();
    assert!(t.gateway.list_sessions().await.is_empty());
}

#[tokio::test]
async fn test_handshake_timeout_forces_teardown() {
    let t = test_gateway(Some(Duration::from_millis(100)));
    let id = t.gateway.create_session("python3").await.unwrap();
    let kernel = t.transport.kernel(&id);
    let attachment = t
        .gateway
        .attach(&id, JupyterChannel::Shell, "client-1")
        .await
        .unwrap();

    let result = t.gateway.terminate_session(&id).await;
    match result {
        Err(e) => {
            assert!(matches!(e, KGError::HandshakeTimeout(..)));
            assert_eq!(e.status_code(), hyper::StatusCode::GATEWAY_TIMEOUT);
        }
        Ok(()) => panic!("expected a timeout"),
    }

    // The unanswered request reached the kernel
    assert_eq!(kernel.shell.next().await.header.msg_type, "shutdown_request");
    assert!(t.gateway.list_sessions().await.is_empty());
    assert_eq!(t.provisioner.kills(), 1);
    assert!(recv_soon(attachment.recv()).await.is_none());
}

#[tokio::test]
async fn test_teardown_failure_is_reported() {
    let t = test_gateway(Some(WAIT));
    t.provisioner.fail_kill.store(true, Ordering::SeqCst);
    let id = t.gateway.create_session("python3").await.unwrap();
    let kernel = t.transport.kernel(&id);
    let attachment = t
        .gateway
        .attach(&id, JupyterChannel::Control, "client-1")
        .await
        .unwrap();

    let replier = kernel.reply_to_shutdown(false);
    let result = t.gateway.terminate_session(&id).await;
    replier.await.unwrap();
    match result {
        Err(KGError::TeardownFailed(session_id, errors)) => {
            assert_eq!(session_id, id);
            assert_eq!(errors.len(), 1);
        }
        other => panic!("expected TeardownFailed, got {:?}", other),
    }

    // The remaining steps still ran
    assert!(recv_soon(attachment.recv()).await.is_none());
    assert!(t.gateway.list_sessions().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_all_closes_every_session() {
    let t = test_gateway(Some(WAIT));
    let a = t.gateway.create_session("python3").await.unwrap();
    let b = t.gateway.create_session("ir").await.unwrap();
    let attachment = t
        .gateway
        .attach(&b, JupyterChannel::Stdin, "client-1")
        .await
        .unwrap();
    let session_a = t.gateway.registry().get(&a).await.unwrap();

    t.gateway.shutdown_all().await;

    assert!(t.gateway.list_sessions().await.is_empty());
    assert_eq!(t.provisioner.kills(), 2);
    assert_eq!(session_a.state().await, SessionState::Closed);
    assert!(recv_soon(attachment.recv()).await.is_none());
    assert!(matches!(
        t.gateway.attach(&a, JupyterChannel::IOPub, "late").await,
        Err(KGError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_list_kernel_types() {
    let t = test_gateway(Some(WAIT));
    let kernels = t.gateway.list_kernel_types().await;
    assert_eq!(kernels.len(), 2);
    assert_eq!(kernels["python3"].spec.display_name, "PYTHON3");
    assert!(kernels.contains_key("ir"));
}

#[tokio::test]
async fn test_kernel_connection_lost_during_shutdown() {
    let t = test_gateway(Some(WAIT));
    let id = t.gateway.create_session("python3").await.unwrap();
    let kernel = t.transport.kernel(&id);

    let gateway = t.gateway.clone();
    let terminate = tokio::spawn({
        let id = id.clone();
        async move { gateway.terminate_session(&id).await }
    });
    assert_eq!(kernel.shell.next().await.header.msg_type, "shutdown_request");
    kernel.shell.outgoing.close();

    let result = recv_soon(terminate).await.unwrap();
    assert!(matches!(result, Err(KGError::ChannelClosed(..))));
    assert!(t.gateway.list_sessions().await.is_empty());
    assert_eq!(t.provisioner.kills(), 1);
}

#[tokio::test]
async fn test_session_with_dead_shell_can_still_be_terminated() {
    let t = test_gateway(Some(WAIT));
    let id = t.gateway.create_session("python3").await.unwrap();
    let kernel = t.transport.kernel(&id);
    let session = t.gateway.registry().get(&id).await.unwrap();

    // The kernel drops its shell connection before anyone asks it to stop
    kernel.shell.outgoing.close();
    recv_soon(async {
        while !session.shell().is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    let result = t.gateway.terminate_session(&id).await;
    assert!(matches!(result, Err(KGError::ChannelClosed(..))));
    assert!(t.gateway.list_sessions().await.is_empty());
    assert_eq!(t.provisioner.kills(), 1);
    assert_eq!(session.state().await, SessionState::Closed);

    // Nothing is left to retry against
    assert!(matches!(
        t.gateway.terminate_session(&id).await,
        Err(KGError::SessionNotFound(_))
    ));
    assert!(kernel.shell.incoming.is_empty());
}
