//! Framed UDP channel with per-type listener fan-out.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ChannelConfig;
use crate::dispatch::Dispatcher;
use crate::frame::{decode_frame, encode_frame};
use crate::listener::{ListenerId, ListenerSet};
use crate::lock;
use crate::types::FRAME_HEADER_LEN;

/// A frame as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Type id the frame was sent with.
    pub type_id: u32,
    /// Frame payload.
    pub payload: Bytes,
    /// Address the datagram came from.
    pub source: SocketAddr,
}

/// Receives datagrams of the type ids it is registered for.
///
/// Implemented for any `Fn(Datagram) -> impl Future<Output = ()>`.
pub trait DatagramListener: Send + Sync + 'static {
    /// Called once per arriving datagram, on its own task.
    fn on_datagram(&self, datagram: Datagram) -> BoxFuture<'static, ()>;
}

impl<F, Fut> DatagramListener for F
where
    F: Fn(Datagram) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn on_datagram(&self, datagram: Datagram) -> BoxFuture<'static, ()> {
        Box::pin(self(datagram))
    }
}

type Listeners = Arc<ListenerSet<dyn DatagramListener>>;

struct ReceiveLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ChannelShared {
    config: ChannelConfig,
    listeners: Mutex<HashMap<u32, Listeners>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    receiver: tokio::sync::Mutex<Option<ReceiveLoop>>,
    dispatcher: Dispatcher,
}

/// Type-tagged, size-bounded datagrams over one UDP socket.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct FramedChannel {
    shared: Arc<ChannelShared>,
}

impl FramedChannel {
    /// Create an unstarted channel.
    pub fn new(config: ChannelConfig) -> Self {
        let dispatcher = Dispatcher::new(config.dispatch_limit);
        Self {
            shared: Arc::new(ChannelShared {
                config,
                listeners: Mutex::new(HashMap::new()),
                socket: Mutex::new(None),
                receiver: tokio::sync::Mutex::new(None),
                dispatcher,
            }),
        }
    }

    /// Channel settings.
    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// True between a successful `start` and `stop`.
    pub fn is_started(&self) -> bool {
        lock(&self.shared.socket).is_some()
    }

    /// Address the socket is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|socket| socket.local_addr().ok())
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        lock(&self.shared.socket).clone()
    }

    /// Bind the socket and spawn the receive loop.
    ///
    /// Returns false if the port cannot be bound. Starting a started channel
    /// is a no-op that returns true.
    pub async fn start(&self) -> bool {
        let mut receiver = self.shared.receiver.lock().await;
        if receiver.is_some() {
            debug!("datagram channel already started");
            return true;
        }

        let config = &self.shared.config;
        let addr = SocketAddr::new(config.bind_addr, config.preferred_port.unwrap_or(0));
        let socket = match UdpSocket::bind(addr).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!("Could not bind datagram channel to {}: {}", addr, e);
                return false;
            }
        };

        match socket.local_addr() {
            Ok(local) => info!("Datagram channel bound to {}", local),
            Err(_) => info!("Datagram channel bound to {}", addr),
        }

        *lock(&self.shared.socket) = Some(Arc::clone(&socket));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            socket,
            cancel.clone(),
        ));
        *receiver = Some(ReceiveLoop { cancel, handle });
        true
    }

    /// Halt the receive loop and release the socket. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.shared.receiver.lock().await.take() else {
            return;
        };

        lock(&self.shared.socket).take();
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            warn!("Datagram receive loop ended abnormally: {}", e);
        }
        info!("Datagram channel stopped");
    }

    /// Register a listener for `type_id`.
    ///
    /// Registering the same `Arc` for the same type again returns the
    /// original handle.
    pub fn add_listener(&self, type_id: u32, listener: Arc<dyn DatagramListener>) -> ListenerId {
        let set = Arc::clone(
            lock(&self.shared.listeners)
                .entry(type_id)
                .or_insert_with(|| Arc::new(ListenerSet::new())),
        );
        set.add(listener)
    }

    /// Unregister a listener. Returns false if it was not registered for `type_id`.
    pub fn remove_listener(&self, type_id: u32, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared.listeners);
        let Some(set) = listeners.get(&type_id) else {
            return false;
        };
        let removed = set.remove(id);
        if set.is_empty() {
            listeners.remove(&type_id);
        }
        removed
    }

    /// Number of listeners registered for `type_id`.
    pub fn listener_count(&self, type_id: u32) -> usize {
        lock(&self.shared.listeners)
            .get(&type_id)
            .map_or(0, |set| set.len())
    }

    /// Frame `payload` under `type_id` and send it to `dest`.
    ///
    /// Returns false, without sending anything, if the payload is larger
    /// than the configured maximum, the channel is not started, or the
    /// socket reports an error.
    pub async fn send(&self, type_id: u32, payload: &[u8], dest: SocketAddr) -> bool {
        let frame = match encode_frame(type_id, payload, self.shared.config.max_payload) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Refusing to send datagram to {}: {}", dest, e);
                return false;
            }
        };

        let Some(socket) = self.socket() else {
            warn!("Datagram channel is not started; dropping send to {}", dest);
            return false;
        };

        match socket.send_to(&frame, dest).await {
            Ok(_) => {
                trace!("Sent type {} ({} bytes) to {}", type_id, payload.len(), dest);
                true
            }
            Err(e) => {
                error!("Could not send datagram to {}: {}", dest, e);
                false
            }
        }
    }
}

impl std::fmt::Debug for FramedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedChannel")
            .field("local_addr", &self.local_addr())
            .field("config", &self.shared.config)
            .finish()
    }
}

async fn receive_loop(shared: Arc<ChannelShared>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let max_payload = shared.config.max_payload;
    let recv_timeout = shared.config.recv_timeout;
    let mut buf = vec![0u8; FRAME_HEADER_LEN + max_payload];

    while !cancel.is_cancelled() {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = tokio::time::timeout(recv_timeout, socket.recv_from(&mut buf)) => received,
        };

        let (len, source) = match received {
            Err(_elapsed) => continue,
            Ok(Err(e)) => {
                warn!("Error receiving datagram: {}", e);
                continue;
            }
            Ok(Ok(received)) => received,
        };

        match decode_frame(&buf[..len], max_payload) {
            Ok(frame) => {
                let datagram = Datagram {
                    type_id: frame.type_id,
                    payload: frame.payload,
                    source,
                };
                shared.deliver(datagram).await;
            }
            Err(e) => debug!("Dropping malformed datagram from {}: {}", source, e),
        }
    }

    debug!("Datagram receive loop exiting");
}

impl ChannelShared {
    async fn deliver(&self, datagram: Datagram) {
        let listeners = lock(&self.listeners).get(&datagram.type_id).cloned();
        let Some(listeners) = listeners else {
            trace!("No listener for type {} from {}", datagram.type_id, datagram.source);
            return;
        };

        for listener in listeners.snapshot() {
            self.dispatcher
                .dispatch(listener.on_datagram(datagram.clone()))
                .await;
        }
    }
}
