// Transport-agnostic peer identity, send backlog, and the peer registry.
// Numan Thabit 2026

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    time::{Duration, Instant},
};

use ahash::AHashMap;
use bytes::Bytes;
use uuid::Uuid;

use crate::{config::PeerSettings, error::NetError};

/// Frames a peer may park while its transport has no open channel.
const BACKLOG_LIMIT: usize = 1024;

/// Globally unique peer identifier (UUIDv4); two peers never share one for
/// the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses the textual form produced by [`fmt::Display`].
    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok().map(Self)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Close progression of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCloseState {
    Open,
    Closing,
    Closed,
}

/// One remote endpoint as seen by a transport.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    owner: u64,
    backlog: VecDeque<Bytes>,
    last_activity: Instant,
    close_state: PeerCloseState,
}

impl Peer {
    fn new(owner: u64) -> Self {
        Self {
            id: PeerId::generate(),
            owner,
            backlog: VecDeque::new(),
            last_activity: Instant::now(),
            close_state: PeerCloseState::Open,
        }
    }

    /// Returns the peer identifier.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Tag of the transport that created this peer. The registry is shared
    /// process-wide, so every peer remembers which transport answers for it.
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Marks activity now; postpones the liveness timeout.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Parks a frame for delivery once a channel opens again.
    pub fn backlog_push(&mut self, frame: Bytes) -> Result<(), NetError> {
        if self.close_state != PeerCloseState::Open {
            return Err(NetError::Closed);
        }
        if self.backlog.len() >= BACKLOG_LIMIT {
            return Err(NetError::NotWritable);
        }
        self.backlog.push_back(frame);
        Ok(())
    }

    /// Puts a frame back at the head after a failed flush.
    pub fn backlog_unshift(&mut self, frame: Bytes) {
        self.backlog.push_front(frame);
    }

    /// Takes the oldest parked frame.
    pub fn backlog_pop(&mut self) -> Option<Bytes> {
        self.backlog.pop_front()
    }

    /// Number of parked frames.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Drops every parked frame (abrupt close).
    pub fn backlog_clear(&mut self) {
        self.backlog.clear();
    }

    /// Current close progression.
    pub fn close_state(&self) -> PeerCloseState {
        self.close_state
    }

    /// Moves the peer along its close progression. Idempotent.
    pub fn mark_closing(&mut self) {
        if self.close_state == PeerCloseState::Open {
            self.close_state = PeerCloseState::Closing;
        }
    }

    /// Finalizes the close. Idempotent.
    pub fn mark_closed(&mut self) {
        self.close_state = PeerCloseState::Closed;
    }

    /// Returns true once the peer finished closing.
    pub fn is_closed(&self) -> bool {
        self.close_state == PeerCloseState::Closed
    }

    /// A peer is alive while its transport reports it connected or its
    /// inactivity stays under `timeout`.
    pub fn is_alive(&self, transport_connected: bool, timeout: Duration) -> bool {
        if self.close_state == PeerCloseState::Closed {
            return false;
        }
        transport_connected || self.idle_for() < timeout
    }
}

/// Registry mapping peer ids to peers, with a periodic dead-peer sweep.
///
/// One registry serves the whole process (see
/// [`SharedPeerManager::process_default`]); peers from every transport share
/// the map, so ids stay globally unique and lookups work across transports.
/// Liveness questions take a `connected` predicate, and sweeps are scoped to
/// one owner tag so a transport only reaps peers it answers for.
pub struct PeerManager {
    peers: AHashMap<PeerId, Peer>,
    timeout: Duration,
    cleanup_interval: Duration,
    last_cleanup: Instant,
}

impl PeerManager {
    /// Creates a registry from peer settings.
    pub fn new(settings: &PeerSettings) -> Self {
        Self {
            peers: AHashMap::new(),
            timeout: settings.timeout(),
            cleanup_interval: settings.cleanup_interval(),
            last_cleanup: Instant::now(),
        }
    }

    /// Registers a brand-new peer for the transport tagged `owner`.
    pub fn create_peer(&mut self, owner: u64) -> PeerId {
        let peer = Peer::new(owner);
        let id = peer.id();
        self.peers.insert(id, peer);
        id
    }

    /// Number of registered peers, dead ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true when no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Immutable access without a liveness check.
    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Mutable access without a liveness check.
    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    /// Looks a peer up, removing it when it turns out dead: the result is
    /// `Some` iff the peer is alive.
    pub fn lookup<F>(&mut self, id: PeerId, connected: F) -> Option<&mut Peer>
    where
        F: FnOnce(&Peer) -> bool,
    {
        let alive = {
            let peer = self.peers.get(&id)?;
            peer.is_alive(connected(peer), self.timeout)
        };
        if !alive {
            self.peers.remove(&id);
            return None;
        }
        self.peers.get_mut(&id)
    }

    /// Removes a peer outright, returning it for close notifications.
    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    /// Sweeps an owner's dead peers at most once per cleanup interval.
    /// Returns the removed peers so the caller can emit `peer_closed` for
    /// each.
    pub fn maybe_sweep<F>(&mut self, owner: u64, connected: F) -> Vec<Peer>
    where
        F: Fn(&Peer) -> bool,
    {
        if self.last_cleanup.elapsed() <= self.cleanup_interval {
            return Vec::new();
        }
        self.force_sweep(owner, connected)
    }

    /// Sweeps an owner's peers immediately, regardless of the interval.
    /// Peers belonging to other transports are left alone: only their owner
    /// can answer for their connectivity.
    pub fn force_sweep<F>(&mut self, owner: u64, connected: F) -> Vec<Peer>
    where
        F: Fn(&Peer) -> bool,
    {
        self.last_cleanup = Instant::now();
        let timeout = self.timeout;
        let dead: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.owner() == owner)
            .filter(|peer| !peer.is_alive(connected(peer), timeout))
            .map(|peer| peer.id())
            .collect();
        dead.into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .collect()
    }

    /// Snapshot of an owner's peer ids, after an opportunistic sweep.
    pub fn peers<F>(&mut self, owner: u64, connected: F) -> Vec<PeerId>
    where
        F: Fn(&Peer) -> bool,
    {
        let _ = self.maybe_sweep(owner, &connected);
        self.ids_owned(owner)
    }

    /// Plain id snapshot of the whole registry, no sweep.
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Plain id snapshot of one owner's peers, no sweep.
    pub fn ids_owned(&self, owner: u64) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|peer| peer.owner() == owner)
            .map(|peer| peer.id())
            .collect()
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new(&PeerSettings::default())
    }
}

/// Cloneable handle to a mutex-guarded [`PeerManager`].
///
/// Transports hold one of these; [`SharedPeerManager::process_default`]
/// hands out the process-wide registry every transport shares by default,
/// lazily created on first use. Hold the lock only for individual registry
/// operations, never across transport I/O.
#[derive(Clone)]
pub struct SharedPeerManager {
    inner: Arc<Mutex<PeerManager>>,
}

impl SharedPeerManager {
    /// Creates a standalone registry handle (used by tests and by callers
    /// that deliberately want an isolated registry).
    pub fn new(settings: &PeerSettings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PeerManager::new(settings))),
        }
    }

    /// The process-wide registry. Created lazily with the first caller's
    /// settings; later callers receive the same instance.
    pub fn process_default(settings: &PeerSettings) -> SharedPeerManager {
        static DEFAULT: OnceLock<SharedPeerManager> = OnceLock::new();
        DEFAULT.get_or_init(|| SharedPeerManager::new(settings)).clone()
    }

    /// Locks the registry for a batch of operations.
    pub fn lock(&self) -> MutexGuard<'_, PeerManager> {
        self.inner.lock().expect("peer registry")
    }

    /// Registers a brand-new peer for the transport tagged `owner`.
    pub fn create_peer(&self, owner: u64) -> PeerId {
        self.lock().create_peer(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(timeout_s: u64, cleanup_s: u64) -> PeerManager {
        PeerManager::new(&PeerSettings {
            cleanup_interval_s: cleanup_s,
            timeout_s,
        })
    }

    #[test]
    fn ids_are_unique() {
        let mut mgr = PeerManager::default();
        let a = mgr.create_peer(1);
        let b = mgr.create_peer(2);
        assert_ne!(a, b);
        assert_eq!(mgr.len(), 2);

        let text = a.to_string();
        assert_eq!(PeerId::parse(&text), Some(a));
    }

    #[test]
    fn lookup_returns_alive_peers_only() {
        let mut mgr = manager(60, 10);
        let id = mgr.create_peer(1);

        // Alive through recent activity even when the transport is down.
        assert!(mgr.lookup(id, |_| false).is_some());
        // Closed peers are dead regardless of connectivity.
        mgr.get_mut(id).expect("peer").mark_closed();
        assert!(mgr.lookup(id, |_| true).is_none());
        // The dead peer was removed by the failed lookup.
        assert_eq!(mgr.len(), 0);
    }

    #[test]
    fn sweep_removes_disconnected_idle_peers() {
        let mut mgr = manager(60, 10);
        let dead = mgr.create_peer(1);
        let alive = mgr.create_peer(1);
        mgr.get_mut(dead).expect("peer").last_activity =
            Instant::now() - Duration::from_secs(120);

        let removed = mgr.force_sweep(1, |peer| peer.id() == alive);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id(), dead);
        assert_eq!(mgr.peers(1, |_| true), vec![alive]);
    }

    #[test]
    fn connected_peer_survives_inactivity() {
        let mut mgr = manager(1, 10);
        let id = mgr.create_peer(1);
        mgr.get_mut(id).expect("peer").last_activity =
            Instant::now() - Duration::from_secs(30);

        let removed = mgr.force_sweep(1, |_| true);
        assert!(removed.is_empty());
        assert!(mgr.lookup(id, |_| true).is_some());
    }

    #[test]
    fn maybe_sweep_respects_interval() {
        let mut mgr = manager(1, 3600);
        let id = mgr.create_peer(1);
        mgr.get_mut(id).expect("peer").last_activity =
            Instant::now() - Duration::from_secs(30);

        // Interval has not elapsed yet, so nothing is removed.
        assert!(mgr.maybe_sweep(1, |_| false).is_empty());
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn sweep_leaves_other_owners_peers_alone() {
        let mut mgr = manager(60, 10);
        let mine = mgr.create_peer(1);
        let theirs = mgr.create_peer(2);
        mgr.get_mut(mine).expect("peer").last_activity =
            Instant::now() - Duration::from_secs(120);
        mgr.get_mut(theirs).expect("peer").last_activity =
            Instant::now() - Duration::from_secs(120);

        // Owner 1 sweeps: only its own expired peer goes; owner 2's peer
        // stays until its own transport answers for it.
        let removed = mgr.force_sweep(1, |_| false);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id(), mine);
        assert_eq!(mgr.ids_owned(2), vec![theirs]);
    }

    #[test]
    fn shared_registry_is_visible_across_handles() {
        let shared = SharedPeerManager::new(&PeerSettings::default());
        let other_handle = shared.clone();

        let id = shared.create_peer(7);
        assert_eq!(other_handle.lock().get(id).expect("peer").owner(), 7);
        let other_len = other_handle.lock().len();
        let shared_len = shared.lock().len();
        assert_eq!(other_len, shared_len);

        // The process default hands every caller the same registry.
        let a = SharedPeerManager::process_default(&PeerSettings::default());
        let b = SharedPeerManager::process_default(&PeerSettings::default());
        let id = a.create_peer(1);
        assert!(b.lock().get(id).is_some());
    }

    #[test]
    fn backlog_orders_and_bounds_frames() {
        let mut mgr = PeerManager::default();
        let id = mgr.create_peer(1);
        let peer = mgr.get_mut(id).expect("peer");

        peer.backlog_push(Bytes::from_static(b"one")).expect("push");
        peer.backlog_push(Bytes::from_static(b"two")).expect("push");
        assert_eq!(peer.backlog_len(), 2);
        assert_eq!(peer.backlog_pop().expect("frame").as_ref(), b"one");
        peer.backlog_unshift(Bytes::from_static(b"one"));
        assert_eq!(peer.backlog_pop().expect("frame").as_ref(), b"one");
        assert_eq!(peer.backlog_pop().expect("frame").as_ref(), b"two");
        assert!(peer.backlog_pop().is_none());

        for i in 0..BACKLOG_LIMIT {
            peer.backlog_push(Bytes::from(format!("{i}"))).expect("push");
        }
        assert!(matches!(
            peer.backlog_push(Bytes::from_static(b"overflow")),
            Err(NetError::NotWritable)
        ));
    }

    #[test]
    fn closed_peer_rejects_backlog_frames() {
        let mut mgr = PeerManager::default();
        let id = mgr.create_peer(1);
        let peer = mgr.get_mut(id).expect("peer");
        peer.mark_closing();
        assert_eq!(peer.close_state(), PeerCloseState::Closing);
        assert!(matches!(
            peer.backlog_push(Bytes::from_static(b"late")),
            Err(NetError::Closed)
        ));
        peer.mark_closed();
        assert!(peer.is_closed());
    }
}
