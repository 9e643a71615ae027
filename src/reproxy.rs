// Reverse-proxy backend pools: upstream bridges, demand-driven scaling,
// and the learned idle timeout.
// Numan Thabit 2026

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{config::ReproxySettings, error::NetError};

/// Handle for one upstream connection owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BridgeId(pub u64);

/// Handle for one downstream client awaiting a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

/// Opens and closes upstream connections on behalf of a backend. The
/// concrete implementation drives real sockets; completion is reported back
/// through [`Backend::on_bridge_connected`] / [`Backend::on_bridge_error`].
pub trait BridgeConnector {
    /// Starts opening one connection to `upstream`.
    fn open_bridge(&mut self, upstream: &str) -> Result<BridgeId, NetError>;
    /// Tears one connection down.
    fn close_bridge(&mut self, bridge: BridgeId);
}

#[derive(Debug)]
struct Bridge {
    id: BridgeId,
    last_activity: Instant,
}

impl Bridge {
    fn new(id: BridgeId) -> Self {
        Self {
            id,
            last_activity: Instant::now(),
        }
    }

    fn inactive_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Pool of bridges to a single upstream address.
///
/// Three disjoint sets: free, busy, and a count of connections still being
/// opened; their sum never exceeds `max_pool`. The idle timeout is learned:
/// observed activity gaps raise it, upstream-side errors lower it toward the
/// inactivity of the bridge that failed, and free bridges older than the
/// learned value are closed proactively.
pub struct Backend {
    upstream: String,
    min_pool: usize,
    max_pool: usize,
    free: VecDeque<Bridge>,
    busy: VecDeque<Bridge>,
    connecting: usize,
    idle_timeout: Duration,
}

impl Backend {
    /// Creates a pool and opens the first bridge.
    pub fn new<C: BridgeConnector>(
        upstream: &str,
        settings: &ReproxySettings,
        connector: &mut C,
    ) -> Self {
        let mut backend = Self {
            upstream: upstream.to_string(),
            min_pool: settings.min_pool,
            max_pool: settings.max_pool,
            free: VecDeque::new(),
            busy: VecDeque::new(),
            connecting: 0,
            idle_timeout: settings.idle_timeout(),
        };
        backend.open_one(connector);
        backend
    }

    /// The upstream address this pool serves.
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Bridges idle and ready to serve.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Bridges currently serving a client.
    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }

    /// Bridges still connecting.
    pub fn connecting_count(&self) -> usize {
        self.connecting
    }

    /// All bridges owned by the pool, connecting ones included.
    pub fn total(&self) -> usize {
        self.free.len() + self.busy.len() + self.connecting
    }

    /// The currently learned idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn open_one<C: BridgeConnector>(&mut self, connector: &mut C) -> bool {
        if self.total() >= self.max_pool {
            return false;
        }
        match connector.open_bridge(&self.upstream) {
            Ok(_) => {
                self.connecting += 1;
                true
            }
            Err(err) => {
                debug!(upstream = %self.upstream, ?err, "bridge connect failed to start");
                false
            }
        }
    }

    /// Returns true when a free bridge is available right now; otherwise
    /// opportunistically starts opening one (bounded by `max_pool`) and
    /// returns false.
    pub fn has_free_bridge<C: BridgeConnector>(&mut self, connector: &mut C) -> bool {
        if !self.free.is_empty() {
            return true;
        }
        self.open_one(connector);
        false
    }

    /// Pops the oldest free bridge and marks it busy.
    pub fn acquire(&mut self) -> Option<BridgeId> {
        let bridge = self.free.pop_front()?;
        let id = bridge.id;
        self.busy.push_back(bridge);
        Some(id)
    }

    /// Hands a bridge back after its client disconnected. When clients are
    /// waiting or the pool is under its minimum, the bridge is recycled into
    /// a fresh connection; otherwise it is destroyed.
    pub fn release<C: BridgeConnector>(
        &mut self,
        connector: &mut C,
        bridge: BridgeId,
        clients_waiting: bool,
    ) {
        self.forget(bridge);
        connector.close_bridge(bridge);
        if clients_waiting || self.total() < self.min_pool {
            self.open_one(connector);
            debug!(upstream = %self.upstream, "bridge recycled");
        } else {
            debug!(upstream = %self.upstream, "bridge destroyed");
        }
    }

    fn forget(&mut self, bridge: BridgeId) {
        self.free.retain(|b| b.id != bridge);
        self.busy.retain(|b| b.id != bridge);
    }

    fn find_mut(&mut self, bridge: BridgeId) -> Option<&mut Bridge> {
        self.free
            .iter_mut()
            .chain(self.busy.iter_mut())
            .find(|b| b.id == bridge)
    }

    /// Records a connect completion. When `clients_waiting`, the bridge goes
    /// straight to busy and is returned for immediate assignment; otherwise
    /// it joins the free set. Either way the pool is re-scaled afterwards.
    pub fn on_bridge_connected<C: BridgeConnector>(
        &mut self,
        connector: &mut C,
        bridge: BridgeId,
        clients_waiting: bool,
    ) -> Option<BridgeId> {
        self.connecting = self.connecting.saturating_sub(1);
        let assigned = if clients_waiting {
            // Serve the longest-idle free bridge first; the fresh one backs
            // the free set.
            let serve = if let Some(oldest) = self.free.pop_front() {
                self.free.push_back(Bridge::new(bridge));
                oldest
            } else {
                Bridge::new(bridge)
            };
            let id = serve.id;
            self.busy.push_back(serve);
            Some(id)
        } else {
            self.free.push_back(Bridge::new(bridge));
            debug!(
                upstream = %self.upstream,
                free = self.free.len(),
                "new free bridge"
            );
            None
        };
        self.scale(connector, clients_waiting);
        assigned
    }

    /// Opens more bridges while demand or the minimum requires it.
    pub fn scale<C: BridgeConnector>(&mut self, connector: &mut C, clients_waiting: bool) {
        if clients_waiting || self.free.len() < self.min_pool {
            self.open_one(connector);
        }
    }

    /// Records traffic on a bridge: the learned idle timeout grows toward
    /// the observed activity gap.
    pub fn notify_activity(&mut self, bridge: BridgeId) {
        let Some(entry) = self.find_mut(bridge) else {
            return;
        };
        let gap = entry.inactive_for();
        entry.last_activity = Instant::now();
        if gap > self.idle_timeout {
            self.idle_timeout = gap;
        }
    }

    /// Records an upstream-side error on a bridge. The learned idle timeout
    /// drops toward the inactivity of the failed bridge, and any free bridge
    /// now past the timeout is closed proactively. Returns the retired
    /// bridges (the failed one included).
    pub fn on_bridge_error<C: BridgeConnector>(
        &mut self,
        connector: &mut C,
        bridge: BridgeId,
    ) -> Vec<BridgeId> {
        let was_connecting = self.find_mut(bridge).is_none();
        if was_connecting {
            self.connecting = self.connecting.saturating_sub(1);
        }

        let inactivity = self
            .find_mut(bridge)
            .map(|b| b.inactive_for())
            .unwrap_or_default();
        if !was_connecting && inactivity < self.idle_timeout {
            self.idle_timeout = inactivity;
        }
        debug!(
            upstream = %self.upstream,
            inactive_ms = inactivity.as_millis() as u64,
            "bridge error; idle timeout now {:?}",
            self.idle_timeout
        );

        let mut retired = vec![bridge];
        self.forget(bridge);
        connector.close_bridge(bridge);

        let timeout = self.idle_timeout;
        let stale: Vec<BridgeId> = self
            .free
            .iter()
            .filter(|b| b.inactive_for() >= timeout)
            .map(|b| b.id)
            .collect();
        for id in stale {
            self.forget(id);
            connector.close_bridge(id);
            retired.push(id);
        }
        retired
    }

    /// True when a bridge with this id belongs to the pool.
    pub fn owns(&self, bridge: BridgeId) -> bool {
        self.free.iter().chain(self.busy.iter()).any(|b| b.id == bridge)
    }

    #[cfg(test)]
    fn age_bridge(&mut self, bridge: BridgeId, by: Duration) {
        if let Some(entry) = self.find_mut(bridge) {
            entry.last_activity = Instant::now() - by;
        }
    }
}

/// Events produced while matching clients to bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReproxyEvent {
    /// A client got a bridge.
    Assigned { client: ClientId, bridge: BridgeId },
    /// No bridge was free; the client waits for the next connect completion.
    Queued { client: ClientId },
}

/// Front coordinator: one pool per upstream, clients served round-robin
/// across backends and queued when every pool is saturated.
pub struct Reproxy {
    backends: Vec<Backend>,
    next_backend: usize,
    waiting: VecDeque<ClientId>,
}

impl Reproxy {
    /// Creates an empty coordinator.
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
            next_backend: 0,
            waiting: VecDeque::new(),
        }
    }

    /// Registers a backend pool.
    pub fn add_backend(&mut self, backend: Backend) {
        self.backends.push(backend);
    }

    /// Read access to the registered backends.
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Clients currently waiting for a bridge.
    pub fn clients_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Serves a newly arrived client: assign a free bridge from the next
    /// backend in rotation, or queue the client while a bridge opens.
    pub fn client_arrived<C: BridgeConnector>(
        &mut self,
        connector: &mut C,
        client: ClientId,
    ) -> ReproxyEvent {
        let count = self.backends.len();
        for offset in 0..count {
            let idx = (self.next_backend + offset) % count;
            let backend = &mut self.backends[idx];
            if backend.has_free_bridge(connector) {
                let bridge = backend.acquire().expect("free bridge present");
                self.next_backend = (idx + 1) % count;
                return ReproxyEvent::Assigned { client, bridge };
            }
        }
        self.waiting.push_back(client);
        ReproxyEvent::Queued { client }
    }

    /// Routes a connect completion to the owning backend, serving the
    /// longest-waiting client when one exists.
    pub fn bridge_connected<C: BridgeConnector>(
        &mut self,
        connector: &mut C,
        backend_idx: usize,
        bridge: BridgeId,
    ) -> Option<ReproxyEvent> {
        let waiting = !self.waiting.is_empty();
        let assigned =
            self.backends[backend_idx].on_bridge_connected(connector, bridge, waiting)?;
        let client = self.waiting.pop_front()?;
        Some(ReproxyEvent::Assigned {
            client,
            bridge: assigned,
        })
    }

    /// Hands a bridge back after its client went away.
    pub fn client_finished<C: BridgeConnector>(
        &mut self,
        connector: &mut C,
        backend_idx: usize,
        bridge: BridgeId,
    ) {
        let waiting = !self.waiting.is_empty();
        self.backends[backend_idx].release(connector, bridge, waiting);
    }
}

impl Default for Reproxy {
    fn default() -> Self {
        Self::new()
    }
}
