//! Ordered, listener-delivered message exchange over one TCP connection.
//!
//! Each connected session runs two workers: a receiver that decodes
//! messages and fans them out to listeners, and a sender that drains the
//! FIFO send queue. Disconnecting is a handshake: the side that calls
//! [`Session::disconnect`] queues a notice behind its pending data and waits
//! for the peer to close; the peer answers by disconnecting in turn.

use std::collections::VecDeque;
use std::future::Future;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{Message, MessageCodec};
use crate::config::SessionConfig;
use crate::dispatch::Dispatcher;
use crate::error::SessionError;
use crate::listener::{ListenerId, ListenerSet};
use crate::lock;
use crate::types::{DisconnectReason, MessageCode, SessionStatus};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Receives `Data` payloads arriving on a session.
///
/// Implemented for any `Fn(Session, Value) -> impl Future<Output = ()>`.
/// Wrap a closure in [`Reconnecting`] to opt in to reconnect after a failure.
pub trait MessageListener: Send + Sync + 'static {
    /// Called once per inbound data message, on its own task.
    fn on_message(&self, session: Session, payload: Value) -> BoxFuture<'static, ()>;

    /// Whether a failed connection should be redialed for this listener.
    fn reconnect_on_failure(&self) -> bool {
        false
    }

    /// Called once the session reaches `Disconnected`.
    fn on_disconnect(&self, _session: Session, _reason: DisconnectReason) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

impl<F, Fut> MessageListener for F
where
    F: Fn(Session, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn on_message(&self, session: Session, payload: Value) -> BoxFuture<'static, ()> {
        Box::pin(self(session, payload))
    }
}

/// Message handler that asks for reconnect after an unrequested disconnect.
pub struct Reconnecting<F>(pub F);

impl<F, Fut> MessageListener for Reconnecting<F>
where
    F: Fn(Session, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn on_message(&self, session: Session, payload: Value) -> BoxFuture<'static, ()> {
        Box::pin((self.0)(session, payload))
    }

    fn reconnect_on_failure(&self) -> bool {
        true
    }
}

type Reader = FramedRead<OwnedReadHalf, MessageCodec>;
type Writer = FramedWrite<OwnedWriteHalf, MessageCodec>;

struct Workers {
    generation: u64,
    cancel: CancellationToken,
    receiver: JoinHandle<OwnedReadHalf>,
    sender: JoinHandle<OwnedWriteHalf>,
}

struct SessionInner {
    id: u64,
    remote: SocketAddr,
    /// Outbound sessions can redial; accepted ones cannot.
    dials: bool,
    config: SessionConfig,
    status: watch::Sender<SessionStatus>,
    queue: Mutex<VecDeque<Message>>,
    queued: Notify,
    listeners: ListenerSet<dyn MessageListener>,
    dispatcher: Dispatcher,
    notice_owed: AtomicBool,
    /// Set by `disconnect`; stops a reconnect in progress.
    disconnect_requested: watch::Sender<bool>,
    generation: AtomicU64,
    /// Accepted stream waiting for `activate`.
    pending: Mutex<Option<TcpStream>>,
    /// Serializes connect, disconnect and failure recovery.
    workers: tokio::sync::Mutex<Option<Workers>>,
}

/// One reliable, ordered message connection.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create an unconnected session that will dial `remote`.
    pub fn new(remote: SocketAddr, config: SessionConfig) -> Self {
        Self::build(remote, true, config, SessionStatus::AwaitingConnect, None)
    }

    /// Wrap an accepted stream. Workers start on [`activate`](Self::activate).
    pub(crate) fn accepted(stream: TcpStream, remote: SocketAddr, config: SessionConfig) -> Self {
        Self::build(remote, false, config, SessionStatus::Connected, Some(stream))
    }

    fn build(
        remote: SocketAddr,
        dials: bool,
        config: SessionConfig,
        status: SessionStatus,
        pending: Option<TcpStream>,
    ) -> Self {
        let (status, _) = watch::channel(status);
        let dispatcher = Dispatcher::new(config.dispatch_limit);
        Self {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                remote,
                dials,
                config,
                status,
                queue: Mutex::new(VecDeque::new()),
                queued: Notify::new(),
                listeners: ListenerSet::new(),
                dispatcher,
                notice_owed: AtomicBool::new(false),
                disconnect_requested: watch::channel(false).0,
                generation: AtomicU64::new(0),
                pending: Mutex::new(pending),
                workers: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Address of the other end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    /// Messages queued but not yet written.
    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Wait until the session reaches `status`.
    ///
    /// Never resolves if the status is not reached; callers bound it with a
    /// timeout.
    pub async fn wait_for_status(&self, status: SessionStatus) {
        let mut rx = self.inner.status.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|current| *current == status).await;
    }

    /// Wait until the session is `Disconnected`.
    pub async fn closed(&self) {
        self.wait_for_status(SessionStatus::Disconnected).await;
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Open the connection and start both workers.
    ///
    /// Returns false if the peer refuses or does not answer within the
    /// connect timeout, or if this session was accepted rather than dialed.
    /// Connecting a connected session returns true.
    pub async fn connect(&self) -> bool {
        let mut slot = self.inner.workers.lock().await;
        match self.status() {
            SessionStatus::Connected => return true,
            SessionStatus::Disconnecting => return false,
            SessionStatus::AwaitingConnect | SessionStatus::Disconnected => {}
        }
        if !self.inner.dials {
            warn!("Session {} was accepted and cannot redial {}", self.id(), self.inner.remote);
            return false;
        }
        self.inner.disconnect_requested.send_replace(false);
        self.dial(&mut slot).await
    }

    /// Start the workers of an accepted session.
    pub(crate) async fn activate(&self) {
        let mut slot = self.inner.workers.lock().await;
        let Some(stream) = lock(&self.inner.pending).take() else {
            return;
        };
        self.attach(stream, &mut slot);
    }

    /// Queue `payload` as a data message.
    ///
    /// Never blocks on the network; the sender worker writes it.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), SessionError> {
        let message = Message::data(payload)?;
        {
            let mut queue = lock(&self.inner.queue);
            if self.status() != SessionStatus::Connected {
                return Err(SessionError::NotConnected);
            }
            queue.push_back(message);
        }
        self.inner.queued.notify_one();
        Ok(())
    }

    /// Flush pending messages, complete the disconnect handshake and close
    /// the socket. Idempotent.
    ///
    /// A reconnect in progress is abandoned rather than completed.
    pub async fn disconnect(&self) {
        self.inner.disconnect_requested.send_replace(true);
        self.close(DisconnectReason::Local).await;
    }

    async fn close(&self, reason: DisconnectReason) {
        let mut slot = self.inner.workers.lock().await;
        let notice = {
            let mut queue = lock(&self.inner.queue);
            match self.status() {
                SessionStatus::Connected => {}
                SessionStatus::AwaitingConnect => {
                    self.set_status(SessionStatus::Disconnected);
                    return;
                }
                SessionStatus::Disconnecting | SessionStatus::Disconnected => return,
            }
            self.set_status(SessionStatus::Disconnecting);
            let owed = self.inner.notice_owed.swap(false, Ordering::AcqRel);
            if owed {
                queue.push_back(Message::disconnect_notice());
            }
            owed
        };
        self.inner.queued.notify_one();
        debug!("Session {} disconnecting ({:?})", self.id(), reason);

        // Accepted but never activated: there are no workers to drain.
        let pending = lock(&self.inner.pending).take();
        if let Some(stream) = pending {
            drop(stream);
        }

        if let Some(workers) = slot.take() {
            let mut sender = workers.sender;
            let mut notice = notice;
            let drained = match timeout(self.inner.config.write_timeout, &mut sender).await {
                Ok(drained) => drained,
                Err(_) => {
                    warn!(
                        "Session {} could not flush {} messages within {:?}; closing anyway",
                        self.id(),
                        self.pending(),
                        self.inner.config.write_timeout
                    );
                    notice = false;
                    workers.cancel.cancel();
                    sender.await
                }
            };
            let writer = match drained {
                Ok(writer) => Some(writer),
                Err(e) => {
                    warn!("Session {} sender ended abnormally: {}", self.id(), e);
                    None
                }
            };

            let mut receiver = workers.receiver;
            let mut joined = None;
            if notice {
                // The peer closes its end once it has seen the notice.
                match timeout(self.inner.config.disconnect_linger, &mut receiver).await {
                    Ok(result) => joined = Some(result),
                    Err(_) => debug!("Session {} peer did not close within linger", self.id()),
                }
            }
            workers.cancel.cancel();
            let joined = match joined {
                Some(result) => result,
                None => receiver.await,
            };
            let reader = match joined {
                Ok(reader) => Some(reader),
                Err(e) => {
                    warn!("Session {} receiver ended abnormally: {}", self.id(), e);
                    None
                }
            };
            release(reader, writer).await;
        }

        lock(&self.inner.queue).clear();
        self.set_status(SessionStatus::Disconnected);
        info!("Session {} with {} disconnected ({:?})", self.id(), self.inner.remote, reason);
        self.announce_disconnect(reason).await;
    }

    async fn dial(&self, slot: &mut Option<Workers>) -> bool {
        let remote = self.inner.remote;
        debug!("Session {} connecting to {}", self.id(), remote);
        let stream = match timeout(self.inner.config.connect_timeout, TcpStream::connect(remote)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Session {} could not connect to {}: {}", self.id(), remote, e);
                return false;
            }
            Err(_) => {
                warn!("Session {} timed out connecting to {}", self.id(), remote);
                return false;
            }
        };
        self.attach(stream, slot);
        info!("Session {} connected to {}", self.id(), remote);
        true
    }

    fn attach(&self, stream: TcpStream, slot: &mut Option<Workers>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Session {} could not set TCP_NODELAY: {}", self.id(), e);
        }
        let (read, write) = stream.into_split();
        let max_len = self.inner.config.max_message_len;
        let reader = FramedRead::new(read, MessageCodec::new(max_len));
        let writer = FramedWrite::new(write, MessageCodec::new(max_len));

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = CancellationToken::new();
        self.inner.notice_owed.store(true, Ordering::Release);
        self.set_status(SessionStatus::Connected);

        let receiver = tokio::spawn(self.clone().receive(reader, cancel.clone(), generation));
        let sender = tokio::spawn(self.clone().transmit(writer, cancel.clone(), generation));
        *slot = Some(Workers {
            generation,
            cancel,
            receiver,
            sender,
        });
    }

    async fn receive(self, mut reader: Reader, cancel: CancellationToken, generation: u64) -> OwnedReadHalf {
        let read_timeout = self.inner.config.read_timeout;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = timeout(read_timeout, reader.next()) => next,
            };

            match next {
                // Quiet connection; loop to observe cancellation.
                Err(_elapsed) => continue,
                Ok(Some(Ok(message))) => match message.code() {
                    MessageCode::Data => self.deliver(message.into_payload()).await,
                    MessageCode::DisconnectNotice => {
                        info!("Session {} peer {} requested disconnect", self.id(), self.inner.remote);
                        self.inner.notice_owed.store(false, Ordering::Release);
                        let session = self.clone();
                        tokio::spawn(async move { session.close(DisconnectReason::Remote).await });
                        break;
                    }
                },
                Ok(Some(Err(e))) => {
                    if self.status() == SessionStatus::Connected {
                        warn!("Session {} read failed: {}", self.id(), e);
                        self.fail(generation);
                    }
                    break;
                }
                Ok(None) => {
                    if self.status() == SessionStatus::Connected {
                        warn!("Session {} connection closed by {} without notice", self.id(), self.inner.remote);
                        self.fail(generation);
                    } else {
                        debug!("Session {} peer closed", self.id());
                    }
                    break;
                }
            }
        }

        reader.into_inner()
    }

    async fn transmit(self, mut writer: Writer, cancel: CancellationToken, generation: u64) -> OwnedWriteHalf {
        let idle = self.inner.config.idle_interval;

        while !cancel.is_cancelled() {
            let next = {
                let mut queue = lock(&self.inner.queue);
                match queue.pop_front() {
                    Some(message) => Some(message),
                    // Drained after disconnect began.
                    None if self.status() != SessionStatus::Connected => break,
                    None => None,
                }
            };

            let Some(message) = next else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.inner.queued.notified() => {}
                    _ = tokio::time::sleep(idle) => {}
                }
                continue;
            };

            let code = message.code();
            let written = tokio::select! {
                _ = cancel.cancelled() => {
                    lock(&self.inner.queue).push_front(message);
                    break;
                }
                written = writer.send(message.clone()) => written,
            };

            match written {
                Ok(()) => trace!("Session {} wrote {:?} message", self.id(), code),
                Err(e) => {
                    warn!("Session {} write failed: {}", self.id(), e);
                    if code == MessageCode::Data {
                        lock(&self.inner.queue).push_front(message);
                    }
                    self.fail(generation);
                    break;
                }
            }
        }

        writer.into_inner()
    }

    async fn deliver(&self, payload: Value) {
        let listeners = self.inner.listeners.snapshot();
        if listeners.is_empty() {
            trace!("Session {} has no listeners; dropping message", self.id());
            return;
        }
        for listener in listeners {
            self.inner
                .dispatcher
                .dispatch(listener.on_message(self.clone(), payload.clone()))
                .await;
        }
    }

    async fn announce_disconnect(&self, reason: DisconnectReason) {
        for listener in self.inner.listeners.snapshot() {
            self.inner
                .dispatcher
                .dispatch(listener.on_disconnect(self.clone(), reason))
                .await;
        }
    }

    fn fail(&self, generation: u64) {
        let session = self.clone();
        tokio::spawn(async move { session.recover(generation).await });
    }

    /// Tear down a connection that failed on its own, then redial if a
    /// listener asked for it.
    async fn recover(&self, generation: u64) {
        let mut slot = self.inner.workers.lock().await;
        let current = slot.as_ref().map(|workers| workers.generation);
        if current != Some(generation) || self.status() != SessionStatus::Connected {
            return;
        }
        let Some(workers) = slot.take() else {
            return;
        };

        {
            let _queue = lock(&self.inner.queue);
            self.set_status(SessionStatus::Disconnecting);
        }
        self.inner.notice_owed.store(false, Ordering::Release);
        workers.cancel.cancel();
        let writer = workers.sender.await.ok();
        let reader = workers.receiver.await.ok();
        release(reader, writer).await;

        let wants_reconnect = self.inner.dials
            && self
                .inner
                .listeners
                .snapshot()
                .iter()
                .any(|listener| listener.reconnect_on_failure());

        let mut reason = DisconnectReason::Failure;
        if wants_reconnect {
            let attempts = self.inner.config.reconnect_attempts;
            let mut requested = self.inner.disconnect_requested.subscribe();
            for attempt in 1..=attempts {
                let redialed = tokio::select! {
                    _ = async { let _ = requested.wait_for(|stop| *stop).await; } => None,
                    redialed = async {
                        tokio::time::sleep(self.inner.config.reconnect_delay).await;
                        info!("Session {} reconnect attempt {}/{}", self.id(), attempt, attempts);
                        self.dial(&mut slot).await
                    } => Some(redialed),
                };
                match redialed {
                    Some(true) => return,
                    Some(false) => {}
                    None => {
                        info!("Session {} reconnect abandoned; disconnect requested", self.id());
                        reason = DisconnectReason::Local;
                        break;
                    }
                }
            }
            if reason == DisconnectReason::Failure {
                warn!("Session {} giving up on {} after {} attempts", self.id(), self.inner.remote, attempts);
            }
        }

        lock(&self.inner.queue).clear();
        self.set_status(SessionStatus::Disconnected);
        info!("Session {} with {} lost", self.id(), self.inner.remote);
        self.announce_disconnect(reason).await;
    }

    fn set_status(&self, status: SessionStatus) {
        let previous = self.inner.status.send_replace(status);
        if previous != status {
            trace!("Session {} {:?} -> {:?}", self.id(), previous, status);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("status", &self.status())
            .finish()
    }
}

/// Close both directions and drop the socket.
async fn release(reader: Option<OwnedReadHalf>, writer: Option<OwnedWriteHalf>) {
    match (reader, writer) {
        (Some(reader), Some(writer)) => match reader.reunite(writer) {
            Ok(stream) => match stream.into_std() {
                Ok(stream) => {
                    if let Err(e) = stream.shutdown(Shutdown::Both) {
                        trace!("socket shutdown: {}", e);
                    }
                }
                Err(e) => trace!("could not detach socket: {}", e),
            },
            Err(e) => trace!("could not reunite socket halves: {}", e),
        },
        (_, Some(mut writer)) => {
            use tokio::io::AsyncWriteExt;
            if let Err(e) = writer.shutdown().await {
                trace!("socket shutdown: {}", e);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn quick() -> SessionConfig {
        SessionConfig {
            read_timeout: Duration::from_millis(100),
            disconnect_linger: Duration::from_millis(500),
            reconnect_delay: Duration::from_millis(50),
            ..SessionConfig::default()
        }
    }

    async fn pair() -> (Session, Session) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Session::new(addr, quick());
        let (connected, accepted) = tokio::join!(client.connect(), listener.accept());
        assert!(connected);
        let (stream, peer) = accepted.unwrap();
        let server = Session::accepted(stream, peer, quick());
        server.activate().await;
        (client, server)
    }

    fn collector(session: &Session) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        session.add_listener(Arc::new(move |_session: Session, payload: Value| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload);
            }
        }));
        rx
    }

    #[tokio::test]
    async fn test_send_before_connect_is_refused() {
        let session = Session::new("127.0.0.1:9".parse().unwrap(), quick());
        assert_eq!(session.status(), SessionStatus::AwaitingConnect);
        assert!(matches!(session.send(&1), Err(SessionError::NotConnected)));
        assert_eq!(session.pending(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_unconnected_session() {
        let session = Session::new("127.0.0.1:9".parse().unwrap(), quick());
        session.disconnect().await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = Session::new(addr, quick());
        assert!(!session.connect().await);
        assert_eq!(session.status(), SessionStatus::AwaitingConnect);
    }

    #[tokio::test]
    async fn test_every_message_is_delivered() {
        let (client, server) = pair().await;
        let mut rx = collector(&server);

        for n in 0..20 {
            client.send(&n).unwrap();
        }
        let mut got = Vec::new();
        while got.len() < 20 {
            let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            got.push(value.as_i64().unwrap());
        }
        got.sort_unstable();
        assert_eq!(got, (0..20).collect::<Vec<_>>());

        client.disconnect().await;
        tokio::time::timeout(Duration::from_secs(2), server.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_accepted_session_cannot_redial() {
        let (client, server) = pair().await;
        client.disconnect().await;
        tokio::time::timeout(Duration::from_secs(2), server.closed())
            .await
            .unwrap();
        assert!(!server.connect().await);
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let a = Session::new("127.0.0.1:9".parse().unwrap(), quick());
        let b = Session::new("127.0.0.1:9".parse().unwrap(), quick());
        assert_ne!(a.id(), b.id());
    }
}
