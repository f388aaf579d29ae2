//
// channel_pair.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Multiplexing of one kernel channel between the kernel and any number of
//! attached connections.
//!
//! Every message the kernel emits is copied, in order, to every subscriber's
//! queue by a single pump task. Messages from attached connections are all
//! sent into the one kernel endpoint. Attachments and internal subscriptions
//! are handles: dropping one removes its registration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_channel::{Receiver, Sender};
use kgshared::jupyter_message::{JupyterChannel, JupyterMessage};
use tokio_util::sync::CancellationToken;

use crate::audit;
use crate::error::KGError;
use crate::transport::KernelEndpoint;

/// Selects the kernel messages delivered to an internal subscription.
pub type MessageFilter = Box<dyn Fn(&JupyterMessage) -> bool + Send + Sync>;

struct Subscriber {
    tx: Sender<JupyterMessage>,

    /// Only messages passing the filter are delivered; `None` delivers all
    filter: Option<MessageFilter>,

    /// The remote peer, for attachments; internal subscriptions have none
    /// and are not audited
    peer: Option<String>,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: HashMap<u64, Subscriber>,
}

struct Shared {
    session_id: String,
    endpoint: KernelEndpoint,
    subscribers: Mutex<Subscribers>,

    /// Set once the pair is closed; no new attachments after that
    closed: AtomicBool,

    /// The owning session's termination token
    terminated: CancellationToken,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        filter: Option<MessageFilter>,
        peer: Option<String>,
    ) -> Result<(u64, Receiver<JupyterMessage>), KGError> {
        let (tx, rx) = async_channel::unbounded();
        let mut subscribers = self.lock();
        // Checked under the lock so a concurrent close can't miss us
        if self.closed.load(Ordering::SeqCst) {
            return Err(KGError::ChannelClosed(
                self.session_id.clone(),
                self.endpoint.channel.to_string(),
            ));
        }
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.entries.insert(id, Subscriber { tx, filter, peer });
        Ok((id, rx))
    }

    /// Remove a subscriber. Returns false if it was already gone.
    fn remove(&self, id: u64) -> bool {
        let removed = self.lock().entries.remove(&id);
        match removed {
            Some(subscriber) => {
                subscriber.tx.close();
                if let Some(peer) = subscriber.peer {
                    audit::connection_detached(&peer, self.endpoint.channel, &self.session_id);
                }
                true
            }
            None => false,
        }
    }

    /// Deliver one kernel message to every interested subscriber.
    ///
    /// A subscriber's queue is only closed after it has been removed, so a
    /// failed send here just means a detach raced this dispatch. Connections
    /// whose remote end has gone away are detached by their websocket task
    /// when reading from or writing to them fails.
    fn dispatch(&self, msg: &JupyterMessage) {
        let subscribers = self.lock();
        for subscriber in subscribers.entries.values() {
            if let Some(filter) = &subscriber.filter {
                if !filter(msg) {
                    continue;
                }
            }
            let _ = subscriber.tx.try_send(msg.clone());
        }
    }

    fn close(&self) -> usize {
        let drained: Vec<Subscriber> = {
            let mut subscribers = self.lock();
            if self.closed.swap(true, Ordering::SeqCst) {
                return 0;
            }
            subscribers.entries.drain().map(|(_, s)| s).collect()
        };

        let mut detached = 0;
        for subscriber in drained {
            subscriber.tx.close();
            if let Some(peer) = subscriber.peer {
                audit::connection_detached(&peer, self.endpoint.channel, &self.session_id);
                detached += 1;
            }
        }

        self.endpoint.close();
        log::debug!(
            "[session {}] Closed {} channel ({} connections detached)",
            self.session_id,
            self.endpoint.channel,
            detached
        );
        detached
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.endpoint.close();
    }
}

/// The bridge between one kernel channel and its attached connections.
#[derive(Clone)]
pub struct ChannelPair {
    shared: Arc<Shared>,
}

impl ChannelPair {
    /// Create a channel pair over a kernel endpoint and start delivering the
    /// kernel's messages.
    pub fn new(session_id: &str, endpoint: KernelEndpoint, terminated: CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            session_id: session_id.to_string(),
            endpoint,
            subscribers: Mutex::new(Subscribers::default()),
            closed: AtomicBool::new(false),
            terminated,
        });
        tokio::spawn(Self::pump(
            Arc::downgrade(&shared),
            shared.endpoint.from_kernel.clone(),
        ));
        Self { shared }
    }

    async fn pump(shared: Weak<Shared>, from_kernel: Receiver<JupyterMessage>) {
        while let Ok(msg) = from_kernel.recv().await {
            let shared = match shared.upgrade() {
                Some(shared) => shared,
                None => break,
            };
            log::trace!(
                "[session {}] {} message from kernel: {}",
                shared.session_id,
                shared.endpoint.channel,
                msg.header.msg_type
            );
            shared.dispatch(&msg);
        }

        // The kernel side went away on its own; nobody attached can be served
        if let Some(shared) = shared.upgrade() {
            if !shared.closed.load(Ordering::SeqCst) {
                log::warn!(
                    "[session {}] Kernel closed the {} channel",
                    shared.session_id,
                    shared.endpoint.channel
                );
                shared.close();
            }
        }
    }

    pub fn channel(&self) -> JupyterChannel {
        self.shared.endpoint.channel
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// The number of remote connections currently attached.
    pub fn attachment_count(&self) -> usize {
        self.shared
            .lock()
            .entries
            .values()
            .filter(|s| s.peer.is_some())
            .count()
    }

    /// Attach a remote connection. The returned handle receives every message
    /// the kernel emits on this channel from now on, and sends the
    /// connection's messages to the kernel.
    pub fn attach(&self, peer: &str) -> Result<Attachment, KGError> {
        let (id, rx) = self.shared.register(None, Some(peer.to_string()))?;
        audit::connection_attached(peer, self.channel(), &self.shared.session_id);
        Ok(Attachment {
            id,
            peer: peer.to_string(),
            rx,
            pair: self.clone(),
        })
    }

    /// Subscribe to the kernel messages accepted by `filter`, without
    /// attaching a connection.
    pub fn subscribe(&self, filter: MessageFilter) -> Result<Subscription, KGError> {
        let (id, rx) = self.shared.register(Some(filter), None)?;
        Ok(Subscription {
            id,
            rx,
            pair: self.clone(),
        })
    }

    /// Send a message to the kernel.
    pub async fn send(&self, msg: JupyterMessage) -> Result<(), KGError> {
        let closed = || {
            KGError::ChannelClosed(self.shared.session_id.clone(), self.channel().to_string())
        };
        if self.is_closed() {
            return Err(closed());
        }
        self.shared
            .endpoint
            .to_kernel
            .send(msg)
            .await
            .map_err(|_| closed())
    }

    /// Detach every connection and close the kernel endpoint. Returns the
    /// number of connections that were detached. Closing twice does nothing.
    pub fn close(&self) -> usize {
        self.shared.close()
    }
}

/// A remote connection attached to a channel pair. Dropping it detaches.
pub struct Attachment {
    id: u64,
    peer: String,
    rx: Receiver<JupyterMessage>,
    pair: ChannelPair,
}

impl Attachment {
    pub fn channel(&self) -> JupyterChannel {
        self.pair.channel()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Forward a message from the connection to the kernel.
    pub async fn send(&self, msg: JupyterMessage) -> Result<(), KGError> {
        if !self.is_attached() {
            return Err(KGError::ChannelClosed(
                self.pair.shared.session_id.clone(),
                self.channel().to_string(),
            ));
        }
        self.pair.send(msg).await
    }

    /// The next message from the kernel, or `None` once the attachment has
    /// been detached and all delivered messages have been read.
    pub async fn recv(&self) -> Option<JupyterMessage> {
        self.rx.recv().await.ok()
    }

    /// True once the owning session has started tearing down.
    pub fn is_terminated(&self) -> bool {
        self.pair.shared.terminated.is_cancelled()
    }

    pub fn is_attached(&self) -> bool {
        !self.rx.is_closed()
    }

    /// Detach from the channel pair. Detaching more than once is a no-op.
    pub fn detach(&self) {
        self.pair.shared.remove(self.id);
        self.rx.close();
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.detach();
    }
}

/// An internal, filtered view of a channel's kernel messages. Dropping it
/// unsubscribes.
pub struct Subscription {
    id: u64,
    rx: Receiver<JupyterMessage>,
    pair: ChannelPair,
}

impl Subscription {
    /// The next matching message, or `None` once the channel is closed.
    pub async fn recv(&self) -> Option<JupyterMessage> {
        self.rx.recv().await.ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pair.shared.remove(self.id);
    }
}
