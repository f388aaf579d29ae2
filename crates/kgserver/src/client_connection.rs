//
// client_connection.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! A remote websocket connection attached to one channel of a session.

use futures::SinkExt;
use futures::StreamExt;
use hyper::header::{HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Body, Request, Response, StatusCode};
use kgshared::jupyter_message::JupyterMessage;
use kgshared::kernel_message::KernelMessage;
use kgshared::websocket_message::WebsocketMessage;
use tokio::select;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::channel_pair::Attachment;

/// How often the client is pinged.
const PING_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(10);

/// How many pings the client may leave unanswered before it is dropped.
const MAX_MISSED_PONGS: u64 = 3;

/// Complete the websocket upgrade for an attached connection and serve it in
/// the background. `accept_key` is derived from the request's
/// `Sec-WebSocket-Key`.
pub fn channel_websocket_request(
    mut request: Request<Body>,
    accept_key: String,
    attachment: Attachment,
) -> Response<Body> {
    let version = request.version();

    tokio::task::spawn(async move {
        match hyper::upgrade::on(&mut request).await {
            Ok(upgraded) => {
                let stream = WebSocketStream::from_raw_socket(
                    upgraded,
                    tokio_tungstenite::tungstenite::protocol::Role::Server,
                    None,
                )
                .await;
                handle_channel_ws(attachment, stream).await;
            }
            Err(e) => {
                log::error!(
                    "[client {}] Failed to upgrade {} connection to websocket: {}",
                    attachment.peer(),
                    attachment.channel(),
                    e
                );
            }
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.version_mut() = version;
    let headers = response.headers_mut();
    headers.append(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.append(UPGRADE, HeaderValue::from_static("websocket"));
    match HeaderValue::from_str(&accept_key) {
        Ok(value) => {
            headers.append(SEC_WEBSOCKET_ACCEPT, value);
        }
        Err(e) => {
            log::error!("Invalid websocket accept key: {}", e);
        }
    }
    response
}

async fn handle_ws_message(attachment: &Attachment, data: &str) {
    let message = match serde_json::from_str::<JupyterMessage>(data) {
        Ok(message) => message,
        Err(e) => {
            log::error!(
                "[client {}] Failed to parse Jupyter message: {}. Raw message: {:?}",
                attachment.peer(),
                e,
                data
            );
            return;
        }
    };

    log::debug!(
        "[client {}] Got message {} of type {}; sending to {}",
        attachment.peer(),
        message.header.msg_id,
        message.header.msg_type,
        attachment.channel()
    );

    if let Err(e) = attachment.send(message).await {
        log::error!(
            "[client {}] Failed to send message to kernel: {}",
            attachment.peer(),
            e
        );
    }
}

/// Pass messages between the websocket and the attachment until either side
/// goes away. The attachment is released when this returns.
pub async fn handle_channel_ws(attachment: Attachment, mut ws_stream: WebSocketStream<Upgraded>) {
    let client_id = format!("{} {}", attachment.peer(), attachment.channel());
    log::info!("[client {}] Connected", client_id);

    let mut tick = tokio::time::interval(PING_INTERVAL);

    // Ping counters
    let mut ping_outbound: u64 = 0;
    let mut pong_inbound: u64 = 0;

    loop {
        select! {
            from_socket = ws_stream.next() => {
                let message = match from_socket {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        log::error!("[client {}] Failed to read data from websocket: {}", client_id, e);
                        break;
                    }
                    None => {
                        log::info!("[client {}] No data from websocket; closing", client_id);
                        break;
                    }
                };
                match message {
                    Message::Text(data) => {
                        handle_ws_message(&attachment, &data).await;
                    },
                    Message::Ping(data) => {
                        // Tungstenite answers pings itself
                        log::trace!("[client {}] Got ping from websocket ({} bytes)", client_id, data.len());
                    },
                    Message::Pong(data) => {
                        let counter = match <[u8; 8]>::try_from(data.as_slice()) {
                            Ok(bytes) => u64::from_be_bytes(bytes),
                            Err(_) => {
                                log::warn!("[client {}] Got pong with invalid data size ({} bytes); ignoring", client_id, data.len());
                                continue;
                            }
                        };
                        if counter != pong_inbound.wrapping_add(1) {
                            log::warn!("[client {}] Got pong {} from websocket; expected {}", client_id, counter, pong_inbound.wrapping_add(1));
                        }
                        pong_inbound = counter;
                        log::trace!("[client {}] Got pong {} from websocket", client_id, pong_inbound);
                    },
                    Message::Binary(data) => {
                        log::warn!("[client {}] Got binary message from websocket ({} bytes); ignoring", client_id, data.len());
                    },
                    Message::Frame(_) => {},
                    Message::Close(_) => {
                        log::info!("[client {}] Websocket closed by client", client_id);
                        break;
                    },
                }
            },
            from_kernel = attachment.recv() => {
                let message = match from_kernel {
                    Some(message) => message,
                    None => {
                        // Detached by the gateway
                        let reason = if attachment.is_terminated() {
                            "session terminated"
                        } else {
                            "channel closed"
                        };
                        log::info!("[client {}] Detaching: {}", client_id, reason);
                        let notice = WebsocketMessage::Kernel(KernelMessage::Detached {
                            reason: reason.to_string(),
                        });
                        match serde_json::to_string(&notice) {
                            Ok(json) => {
                                if let Err(e) = ws_stream.send(Message::Text(json)).await {
                                    log::debug!("[client {}] Failed to send detach notice: {}", client_id, e);
                                }
                            }
                            Err(e) => {
                                log::error!("[client {}] Failed to serialize detach notice: {}", client_id, e);
                            }
                        }
                        if let Err(e) = ws_stream.send(Message::Close(None)).await {
                            log::debug!("[client {}] Failed to close websocket: {}", client_id, e);
                        }
                        break;
                    }
                };
                let json = match serde_json::to_string(&WebsocketMessage::Jupyter(message)) {
                    Ok(json) => json,
                    Err(e) => {
                        log::error!("[client {}] Failed to serialize kernel message: {}", client_id, e);
                        continue;
                    }
                };
                // A client that can't be written to has gone away
                if let Err(e) = ws_stream.send(Message::Text(json)).await {
                    log::info!("[client {}] Failed to send message to websocket: {}", client_id, e);
                    break;
                }
            },
            _ = tick.tick() => {
                let diff = ping_outbound.saturating_sub(pong_inbound);
                if diff > MAX_MISSED_PONGS {
                    log::warn!("[client {}] Lost connection with client; websocket pong counter is behind by {} pings", client_id, diff);
                    break;
                }

                ping_outbound += 1;
                let ping_data = ping_outbound.to_be_bytes().to_vec();
                if let Err(e) = ws_stream.send(Message::Ping(ping_data)).await {
                    log::error!("[client {}] Failed to send ping to websocket: {}", client_id, e);
                    break;
                }
                log::trace!("[client {}] Ping {} / Pong {}", client_id, ping_outbound, pong_inbound);
            },
        }
    }

    attachment.detach();
    log::info!("[client {}] Disconnected", client_id);
}
