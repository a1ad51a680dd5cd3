//! NAT hole punching and keep-alive liveness over a [`FramedChannel`].
//!
//! Each registered peer gets its own worker task driving a small state
//! machine:
//!
//! ```text
//!   Request ──CONTACT_REQUEST──▶ RequestResponse
//!      │                              │
//!      └──CONTACT_RESPONSE / KEEP_ALIVE──▶ KeepAlive (Connected)
//! ```
//!
//! | Phase           | Sends                               | Cap exceeded      |
//! |-----------------|-------------------------------------|-------------------|
//! | Request         | CONTACT_REQUEST + CONTACT_RESPONSE  | `ConnectionError` |
//! | RequestResponse | CONTACT_RESPONSE                    | `ConnectionError` |
//! | KeepAlive       | KEEP_ALIVE (counter reset on ACK)   | `Disconnected`    |
//!
//! A `KEEP_ALIVE` from the peer is acknowledged immediately in every phase.
//! Control payloads carry only the sender's description; the receiver maps
//! it back to a peer, falling back to the source address on first contact.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::channel::{Datagram, DatagramListener, FramedChannel};
use crate::config::{NegotiatorConfig, PhaseTiming};
use crate::dispatch::Dispatcher;
use crate::frame::{decode_description, encode_description};
use crate::listener::ListenerId;
use crate::types::{
    is_control_type, NegotiationPhase, Peer, PeerStatus, CONTACT_REQUEST, CONTACT_RESPONSE,
    CONTROL_TYPE_IDS, KEEP_ALIVE, KEEP_ALIVE_ACK,
};
use crate::{lock, read, write};

const STATUS_DISPATCH_LIMIT: usize = 64;

const REQUEST_SENDS: &[u32] = &[CONTACT_REQUEST, CONTACT_RESPONSE];
const REQUEST_RESPONSE_SENDS: &[u32] = &[CONTACT_RESPONSE];
const KEEP_ALIVE_SENDS: &[u32] = &[KEEP_ALIVE];

/// Notified whenever a peer's status changes.
///
/// Implemented for any `Fn(Peer, PeerStatus) -> impl Future<Output = ()>`.
pub trait PeerStatusListener: Send + Sync + 'static {
    /// Called on its own task after the status has changed.
    fn on_status(&self, peer: Peer, status: PeerStatus) -> BoxFuture<'static, ()>;
}

impl<F, Fut> PeerStatusListener for F
where
    F: Fn(Peer, PeerStatus) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn on_status(&self, peer: Peer, status: PeerStatus) -> BoxFuture<'static, ()> {
        Box::pin(self(peer, status))
    }
}

#[derive(Debug)]
struct NegotiationState {
    phase: NegotiationPhase,
    attempt: u32,
}

/// What the worker does on its next iteration.
enum Step {
    Send {
        type_ids: &'static [u32],
        interval: std::time::Duration,
    },
    GiveUp(PeerStatus),
    Exit,
}

struct PeerEntry {
    peer: Mutex<Peer>,
    state: Mutex<NegotiationState>,
    status: watch::Sender<PeerStatus>,
    wake: Notify,
    cancel: CancellationToken,
    /// Replaced when the peer is added again while still negotiating.
    listener: Mutex<Option<Arc<dyn PeerStatusListener>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PeerEntry {
    fn new(peer: Peer, listener: Option<Arc<dyn PeerStatusListener>>) -> Self {
        let (status, _) = watch::channel(PeerStatus::AwaitingConnection);
        Self {
            peer: Mutex::new(peer),
            state: Mutex::new(NegotiationState {
                phase: NegotiationPhase::Request,
                attempt: 0,
            }),
            status,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            listener: Mutex::new(listener),
            worker: Mutex::new(None),
        }
    }

    fn peer(&self) -> Peer {
        *lock(&self.peer)
    }

    fn status(&self) -> PeerStatus {
        *self.status.borrow()
    }

    fn phase(&self) -> NegotiationPhase {
        lock(&self.state).phase
    }

    /// Decide the next worker action. Runs under the per-peer lock so a
    /// concurrent phase change cannot interleave with the read.
    fn next_step(&self, config: &NegotiatorConfig) -> Step {
        let mut state = lock(&self.state);
        let (timing, type_ids, on_cap): (PhaseTiming, &'static [u32], PeerStatus) = match state.phase {
            NegotiationPhase::Stopped => return Step::Exit,
            NegotiationPhase::Request => (config.request, REQUEST_SENDS, PeerStatus::ConnectionError),
            NegotiationPhase::RequestResponse => (
                config.request_response,
                REQUEST_RESPONSE_SENDS,
                PeerStatus::ConnectionError,
            ),
            NegotiationPhase::KeepAlive => (config.keep_alive, KEEP_ALIVE_SENDS, PeerStatus::Disconnected),
        };

        if state.attempt >= timing.max_attempts {
            warn!(
                "Peer {} gave up in {} phase after {} attempts",
                self.peer(),
                state.phase,
                state.attempt
            );
            state.phase = NegotiationPhase::Stopped;
            self.status.send_replace(on_cap);
            return Step::GiveUp(on_cap);
        }

        state.attempt += 1;
        Step::Send {
            type_ids,
            interval: timing.interval,
        }
    }

    /// Move to `to` if the current phase satisfies `from`. Returns the new
    /// status when the move changed it.
    fn transition(
        &self,
        from: impl Fn(NegotiationPhase) -> bool,
        to: NegotiationPhase,
    ) -> Option<PeerStatus> {
        let mut state = lock(&self.state);
        if state.phase == to || !from(state.phase) {
            return None;
        }

        debug!("Peer {} moving {} -> {}", self.peer(), state.phase, to);
        state.phase = to;
        state.attempt = 0;
        self.wake.notify_one();

        if to == NegotiationPhase::KeepAlive && self.status() != PeerStatus::Connected {
            self.status.send_replace(PeerStatus::Connected);
            return Some(PeerStatus::Connected);
        }
        None
    }

    fn acknowledge(&self) {
        let mut state = lock(&self.state);
        if state.phase == NegotiationPhase::KeepAlive {
            state.attempt = 0;
        }
    }

    /// Stop negotiating. A connected peer becomes disconnected.
    fn halt(&self) -> Option<PeerStatus> {
        let mut state = lock(&self.state);
        state.phase = NegotiationPhase::Stopped;
        let dropped = self.status() == PeerStatus::Connected;
        if dropped {
            self.status.send_replace(PeerStatus::Disconnected);
        }
        // Waiters read the status once cancelled.
        self.cancel.cancel();
        dropped.then_some(PeerStatus::Disconnected)
    }

    async fn publish(&self, dispatcher: &Dispatcher, status: PeerStatus) {
        match status {
            PeerStatus::Connected => info!("Peer {} connected", self.peer()),
            other => info!("Peer {} is now {:?}", self.peer(), other),
        }
        let listener = lock(&self.listener).clone();
        if let Some(listener) = listener {
            dispatcher.dispatch(listener.on_status(self.peer(), status)).await;
        }
    }
}

struct NegotiatorShared {
    channel: FramedChannel,
    config: NegotiatorConfig,
    peers: RwLock<HashMap<SocketAddr, Arc<PeerEntry>>>,
    by_remote: Mutex<HashMap<u64, SocketAddr>>,
    issued: Mutex<HashSet<u64>>,
    dispatcher: Dispatcher,
    control_listeners: Mutex<Vec<(u32, ListenerId)>>,
}

/// Per-peer hole punching on top of a shared datagram channel.
///
/// Cloning yields another handle to the same negotiator.
#[derive(Clone)]
pub struct PeerNegotiator {
    shared: Arc<NegotiatorShared>,
}

impl PeerNegotiator {
    /// Attach a negotiator to `channel`, claiming the control type ids.
    ///
    /// The channel may be started before or after this call; peers make no
    /// progress until it is.
    pub fn new(channel: FramedChannel, config: NegotiatorConfig) -> Self {
        let shared = Arc::new(NegotiatorShared {
            channel: channel.clone(),
            config,
            peers: RwLock::new(HashMap::new()),
            by_remote: Mutex::new(HashMap::new()),
            issued: Mutex::new(HashSet::new()),
            dispatcher: Dispatcher::new(STATUS_DISPATCH_LIMIT),
            control_listeners: Mutex::new(Vec::new()),
        });

        let weak: Weak<NegotiatorShared> = Arc::downgrade(&shared);
        let listener: Arc<dyn DatagramListener> = Arc::new(move |datagram: Datagram| {
            let weak = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    shared.on_control(datagram).await;
                }
            }
        });

        let ids = CONTROL_TYPE_IDS
            .iter()
            .map(|&type_id| (type_id, channel.add_listener(type_id, Arc::clone(&listener))))
            .collect();
        *lock(&shared.control_listeners) = ids;

        Self { shared }
    }

    /// The channel this negotiator sends through.
    pub fn channel(&self) -> &FramedChannel {
        &self.shared.channel
    }

    /// Register `addr` and start punching towards it.
    ///
    /// With `blocking`, waits until the status leaves `AwaitingConnection`
    /// and returns whether it became `Connected`. Without it, returns false
    /// at once; watch progress through `listener` or [`status`](Self::status).
    /// Registering a peer whose negotiation already ended starts a fresh one.
    /// Registering a live peer again keeps its negotiation and, when
    /// `listener` is given, makes it the peer's status listener.
    pub async fn add_peer(
        &self,
        addr: SocketAddr,
        blocking: bool,
        listener: Option<Arc<dyn PeerStatusListener>>,
    ) -> bool {
        let entry = self.shared.register(addr, listener);
        if !blocking {
            return false;
        }

        let mut status = entry.status.subscribe();
        tokio::select! {
            _ = entry.cancel.cancelled() => false,
            settled = status.wait_for(|s| *s != PeerStatus::AwaitingConnection) => {
                matches!(settled.as_deref(), Ok(PeerStatus::Connected))
            }
        }
    }

    /// Stop negotiating with `addr`. Returns false if it was not registered.
    pub async fn remove_peer(&self, addr: SocketAddr) -> bool {
        let Some(entry) = self.shared.unregister(addr) else {
            return false;
        };
        self.shared.retire(entry).await;
        true
    }

    /// Remove every peer.
    pub async fn remove_all_peers(&self) {
        let addrs: Vec<SocketAddr> = read(&self.shared.peers).keys().copied().collect();
        for addr in addrs {
            self.remove_peer(addr).await;
        }
    }

    /// Remove every peer and release the control type ids on the channel.
    pub async fn shutdown(&self) {
        self.remove_all_peers().await;
        for (type_id, id) in lock(&self.shared.control_listeners).drain(..) {
            self.shared.channel.remove_listener(type_id, id);
        }
    }

    /// Current status of `addr`, if registered.
    pub fn status(&self, addr: SocketAddr) -> Option<PeerStatus> {
        self.shared.entry(addr).map(|entry| entry.status())
    }

    /// Current negotiation phase of `addr`, if registered.
    pub fn phase(&self, addr: SocketAddr) -> Option<NegotiationPhase> {
        self.shared.entry(addr).map(|entry| entry.phase())
    }

    /// Consecutive sends in the current phase, if registered.
    pub fn attempts(&self, addr: SocketAddr) -> Option<u32> {
        self.shared.entry(addr).map(|entry| lock(&entry.state).attempt)
    }

    /// Snapshot of the peer record for `addr`.
    pub fn peer(&self, addr: SocketAddr) -> Option<Peer> {
        self.shared.entry(addr).map(|entry| entry.peer())
    }

    /// Snapshot of every registered peer.
    pub fn peers(&self) -> Vec<Peer> {
        read(&self.shared.peers).values().map(|entry| entry.peer()).collect()
    }

    /// Wait until `addr` reaches `status`. Returns false if the peer is not
    /// registered or is removed first.
    pub async fn wait_for_status(&self, addr: SocketAddr, status: PeerStatus) -> bool {
        let Some(entry) = self.shared.entry(addr) else {
            return false;
        };
        let mut rx = entry.status.subscribe();
        tokio::select! {
            _ = entry.cancel.cancelled() => *entry.status.borrow() == status,
            reached = rx.wait_for(|s| *s == status) => reached.is_ok(),
        }
    }

    /// Send an application datagram to a registered peer.
    ///
    /// Control type ids are refused, as are unregistered peers.
    pub async fn send_to_peer(&self, addr: SocketAddr, type_id: u32, payload: &[u8]) -> bool {
        if is_control_type(type_id) {
            warn!("Type id {} is reserved for negotiation", type_id);
            return false;
        }
        if self.shared.entry(addr).is_none() {
            warn!("Peer {} is not registered; datagram not sent", addr);
            return false;
        }
        self.shared.channel.send(type_id, payload, addr).await
    }
}

impl std::fmt::Debug for PeerNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNegotiator")
            .field("peers", &self.peers())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl NegotiatorShared {
    fn entry(&self, addr: SocketAddr) -> Option<Arc<PeerEntry>> {
        read(&self.peers).get(&addr).cloned()
    }

    fn new_description(&self) -> u64 {
        let mut issued = lock(&self.issued);
        let mut rng = rand::thread_rng();
        loop {
            let candidate: u64 = rng.gen();
            if candidate != 0 && issued.insert(candidate) {
                return candidate;
            }
        }
    }

    fn register(
        &self,
        addr: SocketAddr,
        listener: Option<Arc<dyn PeerStatusListener>>,
    ) -> Arc<PeerEntry> {
        let mut peers = write(&self.peers);
        if let Some(existing) = peers.get(&addr) {
            if existing.phase() != NegotiationPhase::Stopped {
                if let Some(listener) = listener {
                    debug!("Peer {} already registered; replacing its status listener", addr);
                    *lock(&existing.listener) = Some(listener);
                } else {
                    debug!("Peer {} already registered", addr);
                }
                return Arc::clone(existing);
            }
            let stale = existing.peer();
            self.forget(&stale);
        }

        let peer = Peer::new(addr, self.new_description());
        let entry = Arc::new(PeerEntry::new(peer, listener));
        let worker = tokio::spawn(negotiate(
            self.channel.clone(),
            self.config.clone(),
            self.dispatcher.clone(),
            Arc::clone(&entry),
        ));
        *lock(&entry.worker) = Some(worker);
        peers.insert(addr, Arc::clone(&entry));
        info!("Negotiating with peer {}", peer);
        entry
    }

    fn unregister(&self, addr: SocketAddr) -> Option<Arc<PeerEntry>> {
        let entry = write(&self.peers).remove(&addr)?;
        self.forget(&entry.peer());
        Some(entry)
    }

    fn forget(&self, peer: &Peer) {
        lock(&self.issued).remove(&peer.local_description);
        if let Some(remote) = peer.remote_description {
            let mut by_remote = lock(&self.by_remote);
            if by_remote.get(&remote) == Some(&peer.addr) {
                by_remote.remove(&remote);
            }
        }
    }

    async fn retire(&self, entry: Arc<PeerEntry>) {
        let changed = entry.halt();
        let worker = lock(&entry.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Negotiation worker for {} ended abnormally: {}", entry.peer(), e);
            }
        }
        if let Some(status) = changed {
            entry.publish(&self.dispatcher, status).await;
        }
        debug!("Peer {} removed", entry.peer());
    }

    /// Find the negotiation a control datagram belongs to.
    fn route(&self, source: SocketAddr, description: u64) -> Option<Arc<PeerEntry>> {
        let known = lock(&self.by_remote).get(&description).copied();
        if let Some(addr) = known {
            if let Some(entry) = self.entry(addr) {
                return Some(entry);
            }
        }

        let entry = self.entry(source)?;
        let previous = {
            let mut peer = lock(&entry.peer);
            peer.remote_description.replace(description)
        };
        let mut by_remote = lock(&self.by_remote);
        if let Some(previous) = previous {
            if previous != description {
                debug!("Peer {} restarted with a new description", source);
            }
            by_remote.remove(&previous);
        }
        by_remote.insert(description, source);
        Some(entry)
    }

    async fn on_control(&self, datagram: Datagram) {
        let Some(description) = decode_description(&datagram.payload) else {
            debug!(
                "Dropping control datagram with {}-byte payload from {}",
                datagram.payload.len(),
                datagram.source
            );
            return;
        };
        let Some(entry) = self.route(datagram.source, description) else {
            trace!("Control datagram {} from unregistered {}", datagram.type_id, datagram.source);
            return;
        };

        let changed = match datagram.type_id {
            CONTACT_REQUEST => entry.transition(
                |phase| phase == NegotiationPhase::Request,
                NegotiationPhase::RequestResponse,
            ),
            CONTACT_RESPONSE => entry.transition(
                |phase| {
                    matches!(
                        phase,
                        NegotiationPhase::Request | NegotiationPhase::RequestResponse
                    )
                },
                NegotiationPhase::KeepAlive,
            ),
            KEEP_ALIVE => {
                let ack = encode_description(entry.peer().local_description);
                if !self.channel.send(KEEP_ALIVE_ACK, &ack, datagram.source).await {
                    debug!("Could not acknowledge keep-alive from {}", datagram.source);
                }
                entry.transition(
                    |phase| phase != NegotiationPhase::Stopped,
                    NegotiationPhase::KeepAlive,
                )
            }
            KEEP_ALIVE_ACK => {
                entry.acknowledge();
                None
            }
            other => {
                trace!("Ignoring non-control type {}", other);
                None
            }
        };

        if let Some(status) = changed {
            entry.publish(&self.dispatcher, status).await;
        }
    }
}

async fn negotiate(
    channel: FramedChannel,
    config: NegotiatorConfig,
    dispatcher: Dispatcher,
    entry: Arc<PeerEntry>,
) {
    let peer = entry.peer();
    let payload = encode_description(peer.local_description);

    loop {
        if entry.cancel.is_cancelled() {
            break;
        }

        match entry.next_step(&config) {
            Step::Exit => break,
            Step::GiveUp(status) => {
                entry.publish(&dispatcher, status).await;
                break;
            }
            Step::Send { type_ids, interval } => {
                for &type_id in type_ids {
                    // A failed send is logged by the channel and counts as an attempt.
                    channel.send(type_id, &payload, peer.addr).await;
                }
                tokio::select! {
                    _ = entry.cancel.cancelled() => break,
                    _ = entry.wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }

    debug!("Negotiation worker for {} exiting", peer);
}
