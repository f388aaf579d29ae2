//
// server.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! The HTTP server: session management routes and the websocket
//! subscription points for each session's channels.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, SEC_WEBSOCKET_KEY, UPGRADE, USER_AGENT,
};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use kgshared::jupyter_message::JupyterChannel;
use kgshared::models;
use regex::Regex;
use serde::Serialize;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::audit;
use crate::client_connection;
use crate::error::KGError;
use crate::gateway::Gateway;

/// A parsed request path.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Spawn(String),
    Shutdown(String),
    List,
    Specs,
    Channel(JupyterChannel, String),
    NotFound,
}

impl Route {
    /// Match a request against the gateway's routes. Only `GET` is served.
    pub fn parse(method: &Method, path: &str) -> Route {
        static ROUTE_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = ROUTE_REGEX.get_or_init(|| {
            Regex::new(r"^/(spawn|shutdown|shell|stdin|iopub|control)/([^/?#]+)$")
                .expect("Invalid regex")
        });

        if *method != Method::GET {
            return Route::NotFound;
        }
        match path {
            "/list" => return Route::List,
            "/specs" => return Route::Specs,
            _ => {}
        }

        let captures = match regex.captures(path) {
            Some(captures) => captures,
            None => return Route::NotFound,
        };
        let (kind, arg) = match (captures.get(1), captures.get(2)) {
            (Some(kind), Some(arg)) => (kind.as_str(), arg.as_str()),
            _ => return Route::NotFound,
        };
        let arg = match percent_encoding::percent_decode(arg.as_bytes()).decode_utf8() {
            Ok(arg) => arg.to_string(),
            Err(_) => return Route::NotFound,
        };

        match kind {
            "spawn" => Route::Spawn(arg),
            "shutdown" => Route::Shutdown(arg),
            channel => match JupyterChannel::from_name(channel) {
                Some(channel) => Route::Channel(channel, arg),
                None => Route::NotFound,
            },
        }
    }
}

/// Serve the gateway on `listener` until `shutdown` completes.
pub async fn serve<F>(
    gateway: Arc<Gateway>,
    listener: std::net::TcpListener,
    shutdown: F,
) -> Result<(), anyhow::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    listener.set_nonblocking(true)?;
    let address = listener.local_addr()?;

    let make_service = make_service_fn(move |conn: &AddrStream| {
        let gateway = gateway.clone();
        let peer = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let gateway = gateway.clone();
                async move { Ok::<_, Infallible>(handle_request(gateway, peer, request).await) }
            }))
        }
    });

    let server = hyper::Server::from_tcp(listener)?
        .serve(make_service)
        .with_graceful_shutdown(shutdown);
    audit::server_started(&address.to_string());
    server.await?;
    Ok(())
}

async fn handle_request(
    gateway: Arc<Gateway>,
    peer: SocketAddr,
    request: Request<Body>,
) -> Response<Body> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|agent| agent.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let mut response = dispatch(&gateway, peer, request).await;

    match HeaderValue::from_str(&gateway.config().cors_origin) {
        Ok(origin) => {
            response
                .headers_mut()
                .insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        Err(e) => {
            log::warn!("Invalid CORS origin '{}': {}", gateway.config().cors_origin, e);
        }
    }

    audit::request(
        &peer.ip().to_string(),
        &method,
        &path,
        response.status(),
        &user_agent,
    );
    response
}

async fn dispatch(gateway: &Gateway, peer: SocketAddr, request: Request<Body>) -> Response<Body> {
    let route = Route::parse(request.method(), request.uri().path());
    match route {
        Route::Spawn(kernel_name) => match gateway.create_session(&kernel_name).await {
            Ok(id) => json_response(StatusCode::OK, &models::SessionId { id }),
            Err(e) => error_response(&e),
        },
        Route::Shutdown(session_id) => match gateway.terminate_session(&session_id).await {
            Ok(()) => json_response(StatusCode::OK, &models::SessionId { id: session_id }),
            Err(e) => error_response(&e),
        },
        Route::List => json_response(StatusCode::OK, &gateway.list_sessions().await),
        Route::Specs => json_response(StatusCode::OK, &gateway.list_kernel_types().await),
        Route::Channel(channel, session_id) => {
            channel_request(gateway, peer, request, channel, &session_id).await
        }
        Route::NotFound => text_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

/// Attach a websocket to one of a session's channels.
async fn channel_request(
    gateway: &Gateway,
    peer: SocketAddr,
    request: Request<Body>,
    channel: JupyterChannel,
    session_id: &str,
) -> Response<Body> {
    if let Err(e) = gateway.registry().get(session_id).await {
        return error_response(&e);
    }

    let accept_key = match websocket_accept_key(&request) {
        Some(key) => key,
        None => {
            return text_response(
                StatusCode::BAD_REQUEST,
                "Expected a websocket upgrade request",
            );
        }
    };

    match gateway.attach(session_id, channel, &peer.to_string()).await {
        Ok(attachment) => client_connection::channel_websocket_request(request, accept_key, attachment),
        Err(e) => error_response(&e),
    }
}

/// The `Sec-WebSocket-Accept` value for a websocket upgrade request, or
/// `None` if the request isn't one.
fn websocket_accept_key(request: &Request<Body>) -> Option<String> {
    let headers = request.headers();
    let upgrade = headers.get(UPGRADE)?.to_str().ok()?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return None;
    }
    let key = headers.get(SEC_WEBSOCKET_KEY)?;
    Some(derive_accept_key(key.as_bytes()))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(json) => {
            let mut response = Response::new(Body::from(json));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            log::error!("Failed to serialize response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

fn error_response(error: &KGError) -> Response<Body> {
    error.log();
    json_response(error.status_code(), &error.to_json(None))
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}
