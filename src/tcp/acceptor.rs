use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::session::Session;
use crate::config::AcceptorConfig;
use crate::listener::{ListenerId, ListenerSet};
use crate::lock;

/// Decides whether an accepted session may stay open.
///
/// Implemented for any `Fn(&Session) -> bool`. Listeners may register
/// message listeners on the session or queue a greeting before returning.
pub trait ConnectListener: Send + Sync + 'static {
    fn on_connect(&self, session: &Session) -> bool;
}

impl<F> ConnectListener for F
where
    F: Fn(&Session) -> bool + Send + Sync + 'static,
{
    fn on_connect(&self, session: &Session) -> bool {
        self(session)
    }
}

struct AcceptLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

struct AcceptorShared {
    config: AcceptorConfig,
    listeners: ListenerSet<dyn ConnectListener>,
    sessions: Mutex<HashMap<u64, Session>>,
    running: tokio::sync::Mutex<Option<AcceptLoop>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Accepts TCP connections and wraps each in a [`Session`].
///
/// Cloning yields another handle to the same acceptor.
#[derive(Clone)]
pub struct SessionAcceptor {
    shared: Arc<AcceptorShared>,
}

impl SessionAcceptor {
    pub fn new(config: AcceptorConfig) -> Self {
        Self {
            shared: Arc::new(AcceptorShared {
                config,
                listeners: ListenerSet::new(),
                sessions: Mutex::new(HashMap::new()),
                running: tokio::sync::Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Bind `port` (0 for any) and start accepting.
    ///
    /// Returns false if the port cannot be bound. Starting a started
    /// acceptor returns true.
    pub async fn start(&self, port: u16) -> bool {
        let mut running = self.shared.running.lock().await;
        if running.is_some() {
            debug!("session acceptor already started");
            return true;
        }

        let addr = SocketAddr::new(self.shared.config.bind_addr, port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Could not bind session acceptor to {}: {}", addr, e);
                return false;
            }
        };
        let local_addr = listener.local_addr().unwrap_or(addr);
        info!("Session acceptor bound to {}", local_addr);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(
            Arc::downgrade(&self.shared),
            listener,
            cancel.clone(),
        ));
        *lock(&self.shared.local_addr) = Some(local_addr);
        *running = Some(AcceptLoop {
            cancel,
            handle,
            local_addr,
        });
        true
    }

    /// Close the listening socket and disconnect every active session.
    /// Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.shared.running.lock().await.take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
        lock(&self.shared.local_addr).take();

        let sessions: Vec<Session> = lock(&self.shared.sessions)
            .drain()
            .map(|(_, session)| session)
            .collect();
        join_all(sessions.iter().map(|session| session.disconnect())).await;
        info!(
            "Session acceptor on {} stopped; closed {} sessions",
            running.local_addr,
            sessions.len()
        );
    }

    /// Address the acceptor is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }

    /// Register a connect listener. Listeners run in registration order.
    pub fn add_connect_listener(&self, listener: Arc<dyn ConnectListener>) -> ListenerId {
        self.shared.listeners.add(listener)
    }

    pub fn remove_connect_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    /// Snapshot of the sessions that passed every connect listener and are
    /// not yet disconnected.
    pub fn sessions(&self) -> Vec<Session> {
        lock(&self.shared.sessions).values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.shared.sessions).len()
    }
}

impl std::fmt::Debug for SessionAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAcceptor")
            .field("local_addr", &self.local_addr())
            .field("sessions", &self.session_count())
            .finish()
    }
}

async fn accept_loop(shared: Weak<AcceptorShared>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                tokio::spawn(admit(shared, stream, addr, cancel.clone()));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }

    debug!("Accept loop exiting");
}

/// Gate a new connection through the connect listeners.
async fn admit(shared: Arc<AcceptorShared>, stream: TcpStream, addr: SocketAddr, cancel: CancellationToken) {
    let session = Session::accepted(stream, addr, shared.config.session.clone());

    let rejected = shared
        .listeners
        .snapshot()
        .into_iter()
        .any(|listener| !listener.on_connect(&session));
    session.activate().await;

    if rejected {
        info!("Session {} from {} rejected by connect listener", session.id(), addr);
        session.disconnect().await;
        return;
    }

    let admitted = {
        let mut sessions = lock(&shared.sessions);
        if cancel.is_cancelled() {
            false
        } else {
            sessions.insert(session.id(), session.clone());
            true
        }
    };
    if !admitted {
        debug!("Acceptor stopping; closing session {} from {}", session.id(), addr);
        session.disconnect().await;
        return;
    }
    info!("Session {} from {} admitted", session.id(), addr);

    let shared = Arc::downgrade(&shared);
    tokio::spawn(async move {
        session.closed().await;
        if let Some(shared) = shared.upgrade() {
            lock(&shared.sessions).remove(&session.id());
            debug!("Session {} left the active set", session.id());
        }
    });
}
