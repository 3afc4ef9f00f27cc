//! Coordinator: accepts and dials peer links, drives the mutual-exclusion protocol,
//! and routes application STATE to the inbound callback.
//!
//! There is no coordinator-wide state lock. The clock is atomic, the ledger and the local
//! phase each lock internally, and the link set is copied out before every broadcast.
//! Stamping an outgoing message and queueing it happen under `send_order`, so every
//! link carries strictly increasing timestamps.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use ramutex_core::wire::{self, FrameEncodeError};
use ramutex_core::{
    Body, LamportClock, Message, MessageKind, NodeId, Phase, PhaseError, RequestId, RequestLedger,
    Round,
};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::link::{LinkError, LinkHandler, PeerLink};
use crate::stats::MessageStats;

/// Default admission poll fallback.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runtime settings for one node.
#[derive(Debug, Clone)]
pub struct Settings {
    pub node_id: NodeId,
    pub bind: SocketAddr,
    /// Upper bound on the wait between admission checks when no change is signalled.
    pub poll_interval: Duration,
    /// Stop waiting on silent peers after this long. `None` waits forever.
    pub reply_timeout: Option<Duration>,
}

impl Settings {
    pub fn new(node_id: NodeId, bind: SocketAddr) -> Self {
        Self {
            node_id,
            bind,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reply_timeout: None,
        }
    }
}

/// Inbound STATE callback: sender id and the payload, verbatim. Runs on the sender's reader task.
pub type StateCallback = Arc<dyn Fn(NodeId, String) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameEncodeError),
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error("coordinator is shut down")]
    ShutDown,
}

pub struct Coordinator {
    settings: Settings,
    local_addr: SocketAddr,
    clock: LamportClock,
    ledger: RequestLedger,
    /// Held from `clock.increment()` until the stamped frame is queued on its links.
    send_order: Mutex<()>,
    phase: Mutex<Phase>,
    links: RwLock<Vec<Arc<PeerLink>>>,
    /// Woken on every ledger, round or membership change.
    changed: Notify,
    on_state: Option<StateCallback>,
    running: AtomicBool,
    next_link_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: MessageStats,
}

impl Coordinator {
    /// Bind the listener and start accepting peers.
    pub async fn bind(
        settings: Settings,
        on_state: Option<StateCallback>,
    ) -> Result<Arc<Self>, CoordinatorError> {
        let listener = TcpListener::bind(settings.bind).await?;
        let local_addr = listener.local_addr()?;
        info!(node = %settings.node_id, %local_addr, "listening for peers");
        let coordinator = Arc::new(Self {
            settings,
            local_addr,
            clock: LamportClock::new(),
            ledger: RequestLedger::new(),
            send_order: Mutex::new(()),
            phase: Mutex::new(Phase::Idle),
            links: RwLock::new(Vec::new()),
            changed: Notify::new(),
            on_state,
            running: AtomicBool::new(true),
            next_link_id: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            stats: MessageStats::default(),
        });
        let accept = tokio::spawn(accept_loop(listener, Arc::downgrade(&coordinator)));
        coordinator.lock_tasks().push(accept);
        Ok(coordinator)
    }

    pub fn node_id(&self) -> NodeId {
        self.settings.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    pub fn stats(&self) -> &MessageStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn lock_send_order(&self) -> MutexGuard<'_, ()> {
        self.send_order.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn links(&self) -> Vec<Arc<PeerLink>> {
        self.links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of open links, bound or not.
    pub fn peer_count(&self) -> usize {
        self.links.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Ids of peers whose links are bound.
    pub fn connected_peers(&self) -> BTreeSet<NodeId> {
        self.links().iter().filter_map(|l| l.peer()).collect()
    }

    /// Whether this node currently waits for or holds the critical section.
    pub fn has_open_request(&self) -> bool {
        !self.lock_phase().is_idle()
    }

    fn register(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        peer: Option<NodeId>,
    ) -> Arc<PeerLink> {
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let link = PeerLink::spawn(id, stream, remote, peer, Arc::downgrade(self));
        let mut links = self.links.write().unwrap_or_else(|e| e.into_inner());
        links.push(link.clone());
        // The reader may already have failed and reported before the push.
        if link.is_closed() {
            links.retain(|l| l.id() != id);
        }
        drop(links);
        link
    }

    /// Dial a peer and announce this node with CONNECT.
    pub async fn connect_to_peer<A: ToSocketAddrs>(
        self: &Arc<Self>,
        addr: A,
        peer: NodeId,
    ) -> Result<(), CoordinatorError> {
        if !self.is_running() {
            return Err(CoordinatorError::ShutDown);
        }
        let stream = match TcpStream::connect(addr).await {
            Ok(s) => s,
            Err(e) => {
                error!(%peer, "failed to connect to peer: {e}");
                return Err(e.into());
            }
        };
        let remote = stream.peer_addr()?;
        {
            // CONNECT must be the first frame on the new link.
            let _order = self.lock_send_order();
            let link = self.register(stream, remote, Some(peer));
            let intro = Message::connect(self.node_id(), self.clock.increment());
            if link.send(&intro) {
                self.stats.record_sent(MessageKind::Connect, 1);
            }
        }
        info!(%peer, %remote, "connected to peer");
        self.changed.notify_waiters();
        Ok(())
    }

    /// Send `msg` on every open link. Returns the number of links it was queued on.
    ///
    /// The caller stamps `msg`; hold `send_order` across stamping and this call.
    fn broadcast(&self, msg: &Message) -> Result<usize, CoordinatorError> {
        let frame = wire::encode_frame(msg)?;
        Ok(self.broadcast_frame(msg.kind(), frame))
    }

    fn broadcast_frame(&self, kind: MessageKind, frame: Vec<u8>) -> usize {
        let sent = self
            .links()
            .iter()
            .filter(|link| link.send_frame(frame.clone()))
            .count();
        self.stats.record_sent(kind, sent as u64);
        sent
    }

    /// Fire-and-forget STATE to every peer, independent of the mutex.
    /// Fails with `CoordinatorError::Frame` if the payload exceeds the frame cap.
    pub fn broadcast_state(&self, payload: impl Into<String>) -> Result<usize, CoordinatorError> {
        let _order = self.lock_send_order();
        let msg = Message::state(self.node_id(), self.clock.increment(), payload);
        self.broadcast(&msg)
    }

    /// Broadcast `provider()` as STATE every `interval` until shutdown.
    pub fn spawn_state_broadcast<F>(self: &Arc<Self>, interval: Duration, provider: F)
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                if !this.is_running() {
                    break;
                }
                if let Err(e) = this.broadcast_state(provider()) {
                    warn!("state broadcast dropped: {e}");
                }
            }
        });
        self.lock_tasks().push(task);
    }

    /// Open a request and run `action` once this node is admitted.
    ///
    /// Returns immediately. The handle resolves to `true` after `action` ran and RELEASE
    /// went out, or `false` if shutdown ended the wait first (`action` is then never run).
    /// Fails with `PhaseError::RequestInFlight` while another local request is open.
    pub fn request_critical_section<F>(
        self: &Arc<Self>,
        action: F,
    ) -> Result<JoinHandle<bool>, CoordinatorError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_running() {
            return Err(CoordinatorError::ShutDown);
        }
        let order = self.lock_send_order();
        let (id, frame) = {
            let mut phase = self.lock_phase();
            if !phase.is_idle() {
                return Err(PhaseError::RequestInFlight.into());
            }
            let timestamp = self.clock.increment();
            let frame = wire::encode_frame(&Message::request(self.node_id(), timestamp))?;
            let id = self.ledger.add_request(self.node_id(), timestamp);
            let round = Round::new(id, self.connected_peers(), Instant::now());
            debug!(timestamp, expected = ?round.expected(), "requesting critical section");
            phase.begin(round)?;
            (id, frame)
        };
        self.broadcast_frame(MessageKind::Request, frame);
        drop(order);
        self.changed.notify_waiters();

        let this = self.clone();
        Ok(tokio::spawn(async move {
            if !this.wait_for_admission(id).await {
                debug!(timestamp = id.timestamp, "request abandoned");
                return false;
            }
            info!(timestamp = id.timestamp, "entered critical section");
            let outcome = panic::catch_unwind(AssertUnwindSafe(action));
            this.release(id);
            if let Err(p) = outcome {
                error!(timestamp = id.timestamp, "critical section action panicked");
                panic::resume_unwind(p);
            }
            true
        }))
    }

    async fn wait_for_admission(&self, id: RequestId) -> bool {
        loop {
            // Registered before the check so a change in between still wakes us.
            let notified = self.changed.notified();
            if !self.is_running() {
                return false;
            }
            match self.poll_admission(id) {
                Some(true) => return true,
                Some(false) => {}
                None => return false,
            }
            let _ = tokio::time::timeout(self.settings.poll_interval, notified).await;
        }
    }

    /// `Some(admitted)` while `id` is the waiting round, `None` once it is gone.
    fn poll_admission(&self, id: RequestId) -> Option<bool> {
        let mut phase = self.lock_phase();
        if phase.round().map(Round::id) != Some(id) {
            return None;
        }
        let Some(replies) = self.ledger.replies_to(&id) else {
            phase.abandon();
            return None;
        };
        let is_earliest = self.ledger.is_earliest(&id);
        let round = phase.round_mut()?;
        if let Some(lease) = self.settings.reply_timeout {
            let silent = round.expire_silent(&replies, Instant::now(), lease);
            if !silent.is_empty() {
                warn!(
                    timestamp = id.timestamp,
                    ?silent,
                    "reply lease expired, no longer waiting on silent peers"
                );
            }
        }
        if !round.can_enter(Some(&replies), is_earliest) {
            return Some(false);
        }
        phase.admit().ok()?;
        Some(true)
    }

    fn release(&self, id: RequestId) {
        // RELEASE goes out before the phase reopens, so it precedes any next REQUEST on every link.
        {
            let _order = self.lock_send_order();
            self.ledger.remove_request(self.node_id());
            let msg = Message::release(self.node_id(), self.clock.increment());
            if let Err(e) = self.broadcast(&msg) {
                error!(timestamp = id.timestamp, "RELEASE not sent: {e}");
            }
        }
        if let Err(e) = self.lock_phase().release() {
            // Shutdown abandoned the phase while the action ran.
            debug!(timestamp = id.timestamp, "release after reset: {e}");
        }
        info!(timestamp = id.timestamp, "released critical section");
        self.changed.notify_waiters();
    }

    /// Dispatch one inbound message. The clock observes it before anything else.
    pub fn handle_message(&self, link: &Arc<PeerLink>, msg: Message) {
        self.clock.observe(msg.timestamp);
        self.stats.record_received(msg.kind());
        let sender = msg.sender;
        match msg.body {
            Body::Connect => {
                if link.bind_peer(sender) {
                    info!(peer = %sender, remote = %link.remote(), "peer connected");
                } else {
                    warn!(peer = %sender, bound = ?link.peer(), "CONNECT on a link bound to another peer");
                }
            }
            Body::Request => {
                let _order = self.lock_send_order();
                self.ledger.add_request(sender, msg.timestamp);
                let reply = Message::reply(self.node_id(), self.clock.increment(), msg.timestamp);
                if link.send(&reply) {
                    self.stats.record_sent(MessageKind::Reply, 1);
                }
            }
            Body::Reply { round: Some(round) } => {
                let id = RequestId::new(self.node_id(), round);
                if !self.ledger.add_reply_to(id, sender) {
                    debug!(peer = %sender, round, "stale reply ignored");
                }
            }
            Body::Reply { round: None } => self.ledger.add_reply(sender),
            Body::Release => {
                self.ledger.remove_request(sender);
            }
            Body::State(payload) => {
                if let Some(cb) = &self.on_state {
                    cb(sender, payload);
                }
                return;
            }
        }
        self.changed.notify_waiters();
    }

    /// Drop a link whose reader stopped. A departed peer is no longer waited on and its
    /// open request is withdrawn, unless another link to the same peer is still open.
    pub fn handle_link_closed(&self, link: &Arc<PeerLink>, reason: &LinkError) {
        info!(remote = %link.remote(), peer = ?link.peer(), "{reason}");
        link.close();
        let remaining = {
            let mut links = self.links.write().unwrap_or_else(|e| e.into_inner());
            links.retain(|l| l.id() != link.id());
            links.clone()
        };
        let Some(peer) = link.peer() else { return };
        if remaining.iter().any(|l| l.peer() == Some(peer)) {
            return;
        }
        if let Some(round) = self.lock_phase().round_mut() {
            if round.forget(peer) {
                warn!(%peer, timestamp = round.id().timestamp, "peer left mid-round, no longer waiting on it");
            }
        }
        if self.ledger.remove_request(peer).is_some() {
            info!(%peer, "withdrew open request of departed peer");
        }
        self.changed.notify_waiters();
    }

    /// Stop accepting, close every link, end background tasks and wake waiters so they give up.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        let links = std::mem::take(&mut *self.links.write().unwrap_or_else(|e| e.into_inner()));
        for link in &links {
            link.close();
        }
        self.lock_phase().abandon();
        self.ledger.clear();
        self.changed.notify_waiters();
        info!(node = %self.node_id(), closed = links.len(), "coordinator shut down");
    }
}

impl LinkHandler for Coordinator {
    fn on_message(&self, link: &Arc<PeerLink>, msg: Message) {
        self.handle_message(link, msg);
    }

    fn on_closed(&self, link: &Arc<PeerLink>, reason: LinkError) {
        self.handle_link_closed(link, &reason);
    }
}

async fn accept_loop(listener: TcpListener, coordinator: Weak<Coordinator>) {
    loop {
        let accepted = listener.accept().await;
        let Some(this) = coordinator.upgrade() else { break };
        if !this.is_running() {
            break;
        }
        match accepted {
            Ok((stream, remote)) => {
                debug!(%remote, "accepted peer connection");
                this.register(stream, remote, None);
            }
            Err(e) => {
                warn!("error accepting connection: {e}");
                let pause = this.settings.poll_interval;
                drop(this);
                tokio::time::sleep(pause).await;
            }
        }
    }
}
