// Socket lifecycle state machine and the event loop that owns it.
// Numan Thabit 2026

use std::{
    os::fd::AsFd,
    rc::Rc,
    sync::{
        mpsc::{sync_channel, Receiver},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::{
    error::NetError,
    metrics::Metrics,
    reactor::{Interest, Reactor, Readiness, ReadyEvent},
    resolver::{CancelToken, Family, NbAddr, ResolveId, Resolver},
    sched::{Scheduler, TaskHandle, PRIORITY_DEFAULT},
    stream::Pipeline,
    throttle::Throttle,
    tls::{HandshakeStatus, TlsCredentials, TlsMode, TlsSession},
};

/// Priority boost applied while a socket is connecting or listening.
const CONNECT_PRIORITY_BUMP: i32 = -50;

const ACCEPT_BACKLOG: i32 = 128;

const REACTOR_QUEUE_DEPTH: usize = 1024;

/// Handle identifying one socket owned by an [`Endpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) u64);

/// Handle identifying a throttling/closure group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Resolving,
    Bound,
    Listening,
    Connecting,
    Connected,
    TlsHandshaking,
    Closing,
}

/// Events surfaced by [`Endpoint::run_once`], in observation order.
/// A `StateChanged` always precedes readable/writable events caused by the
/// new state.
#[derive(Debug)]
pub enum SocketEvent {
    StateChanged {
        socket: SocketId,
        old: SocketState,
        new: SocketState,
    },
    /// A listener accepted `accepted`, which inherited its properties.
    NewConnection {
        listener: SocketId,
        accepted: SocketId,
    },
    Readable {
        socket: SocketId,
    },
    Writable {
        socket: SocketId,
    },
    /// Emitted exactly once per socket, after the handle is released.
    Closed {
        socket: SocketId,
    },
    ConnectTimeout {
        socket: SocketId,
    },
    Error {
        socket: SocketId,
        error: NetError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Bind,
    Connect,
    Listen,
}

struct Group {
    throttle_in: Throttle,
    throttle_out: Throttle,
}

struct SocketEntry {
    state: SocketState,
    family: Family,
    /// OS handle held before the stream pipeline exists (bound, listening,
    /// connecting). Moves into the pipeline on CONNECTED.
    os: Option<Socket>,
    pipeline: Option<Pipeline>,
    watched: Interest,
    cond: Readiness,
    priority: i32,
    actual_priority: i32,
    group: Option<GroupId>,
    intent: Option<Intent>,
    resolve: Option<(ResolveId, CancelToken)>,
    connect_timeout: Option<Duration>,
    timeout_task: Option<TaskHandle>,
    connect_host: Option<String>,
    delayed_close: bool,
    close_emitted: bool,
    tls_creds: Option<Rc<TlsCredentials>>,
    tls_autostart: bool,
    bandwidth_in: u64,
    bandwidth_out: u64,
    latency_in: u64,
    latency_out: u64,
}

impl SocketEntry {
    fn new(family: Family) -> Self {
        Self {
            state: SocketState::Closed,
            family,
            os: None,
            pipeline: None,
            watched: Interest::default(),
            cond: Readiness::default(),
            priority: PRIORITY_DEFAULT,
            actual_priority: PRIORITY_DEFAULT,
            group: None,
            intent: None,
            resolve: None,
            connect_timeout: None,
            timeout_task: None,
            connect_host: None,
            delayed_close: false,
            close_emitted: false,
            tls_creds: None,
            tls_autostart: false,
            bandwidth_in: 0,
            bandwidth_out: 0,
            latency_in: 0,
            latency_out: 0,
        }
    }

    fn apply_throttles(&mut self) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.throttle_in.set_bandwidth(self.bandwidth_in);
            pipeline.throttle_in.set_latency(self.latency_in);
            pipeline.throttle_out.set_bandwidth(self.bandwidth_out);
            pipeline.throttle_out.set_latency(self.latency_out);
        }
    }
}

/// The single-threaded loop owning sockets, scheduler, resolver, and the
/// reactor hand-off. All state transitions run on the thread that calls
/// [`Endpoint::run_once`]; the reactor's poll thread (when enabled) only
/// forwards readiness observations.
pub struct Endpoint {
    reactor: Arc<Reactor>,
    reactor_rx: Option<Receiver<ReadyEvent>>,
    reactor_thread: Option<JoinHandle<()>>,
    sched: Scheduler<Endpoint>,
    resolver: Resolver,
    sockets: AHashMap<u64, SocketEntry>,
    groups: AHashMap<u64, Group>,
    resolving: AHashMap<ResolveId, u64>,
    events: std::collections::VecDeque<SocketEvent>,
    next_token: u64,
    next_group: u64,
    metrics: Arc<Metrics>,
    default_connect_timeout: Option<Duration>,
}

impl Endpoint {
    /// Creates a loop that polls the reactor inline from `run_once`.
    pub fn new() -> Result<Self, NetError> {
        Self::build(false)
    }

    /// Creates a loop with a dedicated reactor poll thread.
    pub fn with_reactor_thread() -> Result<Self, NetError> {
        Self::build(true)
    }

    fn build(threaded: bool) -> Result<Self, NetError> {
        let reactor = Arc::new(Reactor::new()?);
        let metrics = Arc::new(Metrics::new().map_err(|err| {
            NetError::Io(std::io::Error::other(err.to_string()))
        })?);
        let (reactor_rx, reactor_thread) = if threaded {
            let (tx, rx) = sync_channel(REACTOR_QUEUE_DEPTH);
            let join = reactor.start_thread(tx);
            (Some(rx), Some(join))
        } else {
            (None, None)
        };
        Ok(Self {
            reactor,
            reactor_rx,
            reactor_thread,
            sched: Scheduler::new(),
            resolver: Resolver::new(),
            sockets: AHashMap::new(),
            groups: AHashMap::new(),
            resolving: AHashMap::new(),
            events: std::collections::VecDeque::new(),
            next_token: 1,
            next_group: 1,
            metrics,
            default_connect_timeout: None,
        })
    }

    /// Shared metrics registry.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Scheduler access for layered components running on this loop.
    pub fn scheduler(&mut self) -> &mut Scheduler<Endpoint> {
        &mut self.sched
    }

    /// Default connect timeout applied to sockets created afterwards.
    pub fn set_default_connect_timeout(&mut self, timeout: Option<Duration>) {
        self.default_connect_timeout = timeout;
    }

    /// Creates a socket in the CLOSED state.
    pub fn socket(&mut self, family: Family) -> SocketId {
        let token = self.next_token;
        self.next_token += 1;
        let mut entry = SocketEntry::new(family);
        entry.connect_timeout = self.default_connect_timeout;
        self.sockets.insert(token, entry);
        SocketId(token)
    }

    fn entry(&self, id: SocketId) -> Result<&SocketEntry, NetError> {
        self.sockets.get(&id.0).ok_or(NetError::NotConnected)
    }

    fn entry_mut(&mut self, id: SocketId) -> Result<&mut SocketEntry, NetError> {
        self.sockets.get_mut(&id.0).ok_or(NetError::NotConnected)
    }

    /// Current state of a socket.
    pub fn state(&self, id: SocketId) -> SocketState {
        self.sockets
            .get(&id.0)
            .map(|e| e.state)
            .unwrap_or(SocketState::Closed)
    }

    /// Sets the user-requested dispatch priority (lower is more urgent).
    pub fn set_priority(&mut self, id: SocketId, priority: i32) -> Result<(), NetError> {
        let entry = self.entry_mut(id)?;
        entry.priority = priority;
        if !matches!(
            entry.state,
            SocketState::Connecting | SocketState::Resolving | SocketState::Listening
        ) {
            entry.actual_priority = priority;
        }
        Ok(())
    }

    /// Returns the effective dispatch priority.
    pub fn priority(&self, id: SocketId) -> Result<i32, NetError> {
        Ok(self.entry(id)?.actual_priority)
    }

    /// Sets the per-socket connect timeout. `None` disables it.
    pub fn set_connect_timeout(
        &mut self,
        id: SocketId,
        timeout: Option<Duration>,
    ) -> Result<(), NetError> {
        self.entry_mut(id)?.connect_timeout = timeout;
        Ok(())
    }

    /// Configures inbound/outbound bandwidth caps in bytes per second.
    pub fn set_bandwidth(
        &mut self,
        id: SocketId,
        inbound: u64,
        outbound: u64,
    ) -> Result<(), NetError> {
        let entry = self.entry_mut(id)?;
        entry.bandwidth_in = inbound;
        entry.bandwidth_out = outbound;
        entry.apply_throttles();
        Ok(())
    }

    /// Configures minimum inter-operation latency in microseconds.
    pub fn set_latency(
        &mut self,
        id: SocketId,
        inbound_us: u64,
        outbound_us: u64,
    ) -> Result<(), NetError> {
        let entry = self.entry_mut(id)?;
        entry.latency_in = inbound_us;
        entry.latency_out = outbound_us;
        entry.apply_throttles();
        Ok(())
    }

    /// Attaches TLS credentials used by `starttls` and TLS auto-start.
    pub fn set_tls_credentials(
        &mut self,
        id: SocketId,
        creds: Rc<TlsCredentials>,
    ) -> Result<(), NetError> {
        self.entry_mut(id)?.tls_creds = Some(creds);
        Ok(())
    }

    /// Starts TLS automatically on connect/accept.
    pub fn set_tls_autostart(&mut self, id: SocketId, autostart: bool) -> Result<(), NetError> {
        self.entry_mut(id)?.tls_autostart = autostart;
        Ok(())
    }

    /// Creates a throttling/closure group.
    pub fn create_group(&mut self) -> GroupId {
        let gid = self.next_group;
        self.next_group += 1;
        self.groups.insert(
            gid,
            Group {
                throttle_in: Throttle::new(),
                throttle_out: Throttle::new(),
            },
        );
        GroupId(gid)
    }

    /// Configures a group's shared bandwidth caps.
    pub fn set_group_bandwidth(
        &mut self,
        group: GroupId,
        inbound: u64,
        outbound: u64,
    ) -> Result<(), NetError> {
        let group = self.groups.get_mut(&group.0).ok_or(NetError::NotConnected)?;
        group.throttle_in.set_bandwidth(inbound);
        group.throttle_out.set_bandwidth(outbound);
        Ok(())
    }

    /// Puts a socket into a group (or removes it with `None`).
    pub fn set_group(&mut self, id: SocketId, group: Option<GroupId>) -> Result<(), NetError> {
        self.entry_mut(id)?.group = group;
        Ok(())
    }

    /// Closes every socket belonging to the group.
    pub fn close_group(&mut self, group: GroupId) {
        let members: Vec<u64> = self
            .sockets
            .iter()
            .filter(|(_, e)| e.group == Some(group))
            .map(|(&t, _)| t)
            .collect();
        for token in members {
            let _ = self.close(SocketId(token));
        }
    }

    /// Local address of a bound, listening, or connected socket.
    pub fn local_addr(&self, id: SocketId) -> Result<std::net::SocketAddr, NetError> {
        let entry = self.entry(id)?;
        let sock = entry
            .os
            .as_ref()
            .or_else(|| entry.pipeline.as_ref().map(|p| p.socket()))
            .ok_or(NetError::NotConnected)?;
        sock.local_addr()?
            .as_socket()
            .ok_or(NetError::NotConnected)
    }

    // ---- lifecycle operations -------------------------------------------

    /// Starts connecting to a textual address (`host:port` or a path).
    pub fn connect(&mut self, id: SocketId, address: &str) -> Result<(), NetError> {
        self.start_resolving(id, address, Intent::Connect)
    }

    /// Binds to a textual address without listening.
    pub fn bind(&mut self, id: SocketId, address: &str) -> Result<(), NetError> {
        self.start_resolving(id, address, Intent::Bind)
    }

    /// Resolves, binds, and listens in one sweep.
    pub fn listen(&mut self, id: SocketId, address: &str) -> Result<(), NetError> {
        self.start_resolving(id, address, Intent::Listen)
    }

    /// Moves an already-BOUND socket into LISTENING.
    pub fn listen_bound(&mut self, id: SocketId) -> Result<(), NetError> {
        let token = id.0;
        let entry = self.sockets.get_mut(&token).ok_or(NetError::NotConnected)?;
        if entry.state != SocketState::Bound {
            return Err(NetError::NotConnected);
        }
        entry.actual_priority = entry.priority + CONNECT_PRIORITY_BUMP;
        let sock = entry.os.as_ref().expect("bound socket handle");
        sock.listen(ACCEPT_BACKLOG)?;
        self.reactor.add(sock.as_fd(), token, Interest::READABLE)?;
        entry.watched = Interest::READABLE;
        self.set_state(token, SocketState::Listening);
        Ok(())
    }

    fn start_resolving(
        &mut self,
        id: SocketId,
        address: &str,
        intent: Intent,
    ) -> Result<(), NetError> {
        let entry = self.entry_mut(id)?;
        if entry.state != SocketState::Closed {
            return Err(NetError::AlreadyActive);
        }
        entry.intent = Some(intent);
        entry.close_emitted = false;
        entry.actual_priority = entry.priority + CONNECT_PRIORITY_BUMP;
        if intent == Intent::Connect {
            entry.connect_host = address
                .rsplit_once(':')
                .map(|(host, _)| host.trim_matches(['[', ']']).to_string());
        }
        let timeout = if intent == Intent::Connect {
            entry.connect_timeout
        } else {
            None
        };

        let (rid, token) = self.resolver.resolve(address);
        let entry = self.entry_mut(id)?;
        entry.resolve = Some((rid, token));
        self.resolving.insert(rid, id.0);
        self.set_state(id.0, SocketState::Resolving);

        if let Some(timeout) = timeout {
            let sock_token = id.0;
            let handle = self.sched.post_after(timeout, PRIORITY_DEFAULT, move |ep| {
                ep.on_connect_timeout(sock_token);
            });
            self.entry_mut(id)?.timeout_task = Some(handle);
        }
        Ok(())
    }

    /// Cancels an in-flight connect, including a pending resolve.
    pub fn cancel_connect(&mut self, id: SocketId) -> Result<(), NetError> {
        let entry = self.entry_mut(id)?;
        match entry.state {
            SocketState::Resolving | SocketState::Connecting => {
                self.abort_pending(id.0);
                self.release(id.0);
                Ok(())
            }
            _ => Err(NetError::NotConnected),
        }
    }

    fn abort_pending(&mut self, token: u64) {
        if let Some(entry) = self.sockets.get_mut(&token) {
            if let Some((rid, cancel)) = entry.resolve.take() {
                cancel.cancel();
                self.resolving.remove(&rid);
            }
            if let Some(task) = entry.timeout_task.take() {
                task.cancel();
            }
        }
    }

    fn on_connect_timeout(&mut self, token: u64) {
        let state = match self.sockets.get(&token) {
            Some(entry) => entry.state,
            None => return,
        };
        if !matches!(state, SocketState::Resolving | SocketState::Connecting) {
            return;
        }
        self.metrics.connect_timeouts.inc();
        self.events.push_back(SocketEvent::ConnectTimeout {
            socket: SocketId(token),
        });
        self.abort_pending(token);
        self.release(token);
    }

    // ---- resolver integration -------------------------------------------

    fn pump_resolver(&mut self) {
        for reply in self.resolver.poll() {
            let Some(token) = self.resolving.remove(&reply.id) else {
                continue;
            };
            self.on_resolved(token, reply.result);
        }
    }

    fn on_resolved(&mut self, token: u64, result: Result<Vec<NbAddr>, NetError>) {
        let Some(entry) = self.sockets.get_mut(&token) else {
            return;
        };
        if entry.state != SocketState::Resolving {
            return;
        }
        entry.resolve = None;
        let family = entry.family;
        let intent = entry.intent;

        let candidates = match result {
            Ok(candidates) => candidates,
            Err(error) => {
                self.events.push_back(SocketEvent::Error {
                    socket: SocketId(token),
                    error,
                });
                self.abort_pending(token);
                self.release(token);
                return;
            }
        };

        let Some(addr) = candidates.into_iter().find(|c| c.matches(family)) else {
            self.events.push_back(SocketEvent::Error {
                socket: SocketId(token),
                error: NetError::InvalidAddress("no candidate matches socket family".into()),
            });
            self.abort_pending(token);
            self.release(token);
            return;
        };

        let outcome = match intent {
            Some(Intent::Connect) => self.start_connect(token, &addr),
            Some(Intent::Bind) => self.finish_bind(token, &addr, false),
            Some(Intent::Listen) => self.finish_bind(token, &addr, true),
            None => Ok(()),
        };
        if let Err(error) = outcome {
            self.events.push_back(SocketEvent::Error {
                socket: SocketId(token),
                error,
            });
            self.abort_pending(token);
            self.release(token);
        }
    }

    fn open_handle(addr: &NbAddr) -> Result<(Socket, SockAddr), NetError> {
        match addr {
            NbAddr::Inet(sa) => {
                let sock = Socket::new(
                    Domain::for_address(*sa),
                    Type::STREAM,
                    Some(Protocol::TCP),
                )?;
                sock.set_nonblocking(true)?;
                sock.set_keepalive(true)?;
                Ok((sock, SockAddr::from(*sa)))
            }
            NbAddr::Local(path) => {
                let sock = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                sock.set_nonblocking(true)?;
                let sa = SockAddr::unix(path)?;
                Ok((sock, sa))
            }
        }
    }

    fn start_connect(&mut self, token: u64, addr: &NbAddr) -> Result<(), NetError> {
        let (sock, sa) = Self::open_handle(addr)?;
        match sock.connect(&sa) {
            Ok(()) => {}
            Err(err)
                if err.raw_os_error() == Some(nix::libc::EINPROGRESS)
                    || err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(NetError::from_connect_io(err)),
        }
        self.reactor.add(sock.as_fd(), token, Interest::WRITABLE)?;
        let entry = self.sockets.get_mut(&token).expect("resolving socket");
        entry.os = Some(sock);
        entry.watched = Interest::WRITABLE;
        self.set_state(token, SocketState::Connecting);
        Ok(())
    }

    fn finish_bind(&mut self, token: u64, addr: &NbAddr, listen: bool) -> Result<(), NetError> {
        let (sock, sa) = Self::open_handle(addr)?;
        sock.set_reuse_address(true)?;
        sock.bind(&sa)?;
        if listen {
            sock.listen(ACCEPT_BACKLOG)?;
            self.reactor.add(sock.as_fd(), token, Interest::READABLE)?;
        }
        let entry = self.sockets.get_mut(&token).expect("resolving socket");
        entry.os = Some(sock);
        if listen {
            entry.watched = Interest::READABLE;
            self.set_state(token, SocketState::Listening);
        } else {
            entry.actual_priority = entry.priority;
            self.set_state(token, SocketState::Bound);
        }
        Ok(())
    }

    // ---- readiness dispatch ---------------------------------------------

    fn process_readiness(&mut self, event: ReadyEvent) {
        let Some(entry) = self.sockets.get_mut(&event.token) else {
            return;
        };
        let readiness = event.readiness;
        match entry.state {
            SocketState::Listening => {
                if readiness.readable {
                    self.accept_loop(event.token);
                }
            }
            SocketState::Connecting => {
                if readiness.error || readiness.hangup {
                    self.fail_connect(event.token);
                } else if readiness.writable {
                    self.establish(event.token);
                }
            }
            SocketState::TlsHandshaking => {
                if readiness.readable {
                    if let Some(entry) = self.sockets.get_mut(&event.token) {
                        entry.cond.readable = true;
                    }
                }
                if readiness.writable {
                    if let Some(entry) = self.sockets.get_mut(&event.token) {
                        entry.cond.writable = true;
                    }
                }
                self.drive_handshake(event.token);
                if readiness.hangup {
                    self.handle_hangup(event.token);
                }
            }
            SocketState::Connected => {
                if readiness.readable {
                    entry.cond.readable = true;
                    self.events.push_back(SocketEvent::Readable {
                        socket: SocketId(event.token),
                    });
                }
                if readiness.writable {
                    self.on_writable(event.token);
                }
                if readiness.hangup {
                    self.handle_hangup(event.token);
                }
            }
            SocketState::Closing => {
                if readiness.writable {
                    self.continue_close(event.token);
                }
                if readiness.hangup || readiness.error {
                    self.release(event.token);
                }
            }
            _ => {
                debug!(token = event.token, state = ?entry.state, "stray readiness");
            }
        }
    }

    fn accept_loop(&mut self, token: u64) {
        let mut accepted = Vec::new();
        {
            let Some(entry) = self.sockets.get_mut(&token) else {
                return;
            };
            let Some(listener) = entry.os.as_ref() else {
                return;
            };
            loop {
                match listener.accept() {
                    Ok((sock, _addr)) => accepted.push(sock),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        self.events.push_back(SocketEvent::Error {
                            socket: SocketId(token),
                            error: NetError::AcceptFailed(err),
                        });
                        break;
                    }
                }
            }
        }

        for sock in accepted {
            if let Err(error) = self.adopt_accepted(token, sock) {
                warn!(listener = token, ?error, "failed to adopt accepted socket");
                self.events.push_back(SocketEvent::Error {
                    socket: SocketId(token),
                    error,
                });
            }
        }
    }

    fn adopt_accepted(&mut self, listener_token: u64, sock: Socket) -> Result<(), NetError> {
        sock.set_nonblocking(true)?;
        let _ = sock.set_keepalive(true);

        let (priority, group, tls_creds, tls_autostart, family, bw) = {
            let listener = self.sockets.get(&listener_token).expect("listener entry");
            (
                listener.priority,
                listener.group,
                listener.tls_creds.clone(),
                listener.tls_autostart,
                listener.family,
                (
                    listener.bandwidth_in,
                    listener.bandwidth_out,
                    listener.latency_in,
                    listener.latency_out,
                ),
            )
        };

        let token = self.next_token;
        self.next_token += 1;
        let mut entry = SocketEntry::new(family);
        entry.priority = priority;
        entry.actual_priority = priority;
        entry.group = group;
        entry.tls_creds = tls_creds;
        entry.tls_autostart = tls_autostart;
        entry.bandwidth_in = bw.0;
        entry.bandwidth_out = bw.1;
        entry.latency_in = bw.2;
        entry.latency_out = bw.3;

        self.reactor.add(sock.as_fd(), token, Interest::BOTH)?;
        entry.watched = Interest::BOTH;
        entry.pipeline = Some(Pipeline::new(sock));
        entry.apply_throttles();
        self.sockets.insert(token, entry);
        self.metrics.sockets_accepted.inc();

        self.set_state(token, SocketState::Connected);
        self.events.push_back(SocketEvent::NewConnection {
            listener: SocketId(listener_token),
            accepted: SocketId(token),
        });

        let autostart = self
            .sockets
            .get(&token)
            .map(|e| e.tls_autostart && e.tls_creds.is_some())
            .unwrap_or(false);
        if autostart {
            self.starttls(SocketId(token), TlsMode::Server)?;
        }
        Ok(())
    }

    fn fail_connect(&mut self, token: u64) {
        let error = self
            .sockets
            .get(&token)
            .and_then(|e| e.os.as_ref())
            .and_then(|s| s.take_error().ok().flatten())
            .map(NetError::from_connect_io)
            .unwrap_or(NetError::ConnectRefused);
        self.metrics.connect_refused.inc();
        self.events.push_back(SocketEvent::Error {
            socket: SocketId(token),
            error,
        });
        self.abort_pending(token);
        self.release(token);
    }

    fn establish(&mut self, token: u64) {
        // A writable edge on a connecting socket either completes the
        // connection or reports the SO_ERROR that sank it.
        let pending_error = self
            .sockets
            .get(&token)
            .and_then(|e| e.os.as_ref())
            .and_then(|s| s.take_error().ok().flatten());
        if pending_error.is_some() {
            self.fail_connect(token);
            return;
        }

        self.abort_pending(token);
        let Some(entry) = self.sockets.get_mut(&token) else {
            return;
        };
        let sock = entry.os.take().expect("connecting handle");
        if let Err(error) = self
            .reactor
            .modify(sock.as_fd(), token, Interest::BOTH)
        {
            self.events.push_back(SocketEvent::Error {
                socket: SocketId(token),
                error,
            });
            self.release(token);
            return;
        }
        let entry = self.sockets.get_mut(&token).expect("entry");
        entry.watched = Interest::BOTH;
        entry.pipeline = Some(Pipeline::new(sock));
        entry.apply_throttles();
        entry.cond.writable = true;
        entry.actual_priority = entry.priority;
        self.metrics.sockets_connected.inc();
        self.set_state(token, SocketState::Connected);
        self.events.push_back(SocketEvent::Writable {
            socket: SocketId(token),
        });

        let entry = self.sockets.get(&token).expect("entry");
        if entry.tls_autostart && entry.tls_creds.is_some() {
            if let Err(error) = self.starttls(SocketId(token), TlsMode::Client) {
                self.events.push_back(SocketEvent::Error {
                    socket: SocketId(token),
                    error,
                });
            }
        }
    }

    fn on_writable(&mut self, token: u64) {
        let Some(entry) = self.sockets.get_mut(&token) else {
            return;
        };
        entry.cond.writable = true;
        let has_pending = entry
            .pipeline
            .as_ref()
            .map(|p| p.has_pending_output())
            .unwrap_or(false);
        if has_pending {
            let _ = self.flush_socket(token);
        }
        self.events.push_back(SocketEvent::Writable {
            socket: SocketId(token),
        });
    }

    fn handle_hangup(&mut self, token: u64) {
        let Some(entry) = self.sockets.get_mut(&token) else {
            return;
        };
        let has_buffered = entry
            .pipeline
            .as_ref()
            .map(|p| p.has_buffered_input())
            .unwrap_or(false);
        if has_buffered {
            // Bytes remain for the application; defer the close until the
            // pipeline drains.
            entry.delayed_close = true;
            return;
        }

        if entry.pipeline.as_ref().map(|p| p.has_tls()).unwrap_or(false) {
            entry.delayed_close = true;
            self.events.push_back(SocketEvent::Readable {
                socket: SocketId(token),
            });
            return;
        }

        // Read-confirmation: a one-byte peek distinguishes a true half-close
        // from a spurious hang-up notification.
        let eof = entry
            .pipeline
            .as_mut()
            .map(|p| p.peek_eof())
            .transpose()
            .unwrap_or(Some(true))
            .unwrap_or(true);
        if eof {
            self.release(token);
        } else {
            let entry = self.sockets.get_mut(&token).expect("entry");
            entry.delayed_close = true;
            self.events.push_back(SocketEvent::Readable {
                socket: SocketId(token),
            });
        }
    }

    // ---- data path ------------------------------------------------------

    /// Reads plaintext from a connected socket.
    pub fn read(&mut self, id: SocketId, buf: &mut [u8]) -> Result<usize, NetError> {
        let token = id.0;
        let entry = self.sockets.get_mut(&token).ok_or(NetError::NotConnected)?;
        if !matches!(entry.state, SocketState::Connected | SocketState::Closing) {
            return Err(NetError::NotConnected);
        }
        let pipeline = entry.pipeline.as_mut().ok_or(NetError::NotConnected)?;
        let (group_in, group_out) = match entry.group {
            Some(gid) => match self.groups.get_mut(&gid.0) {
                Some(group) => (Some(&mut group.throttle_in), Some(&mut group.throttle_out)),
                None => (None, None),
            },
            None => (None, None),
        };

        let outcome = pipeline.read(group_in, group_out, buf)?;

        if outcome.n > 0 {
            self.metrics.bytes_in.inc_by(outcome.n as u64);
            self.metrics.read_chunk_bytes.observe(outcome.n as f64);
        }
        if outcome.would_block {
            entry.cond.readable = false;
        }
        let priority = entry.actual_priority;
        let delayed_close = entry.delayed_close;
        let buffered = pipeline.has_buffered_input();

        if let Some(delay) = outcome.delay {
            self.metrics.throttle_stalls.inc();
            self.sched.post_after(delay, priority, move |ep| {
                if let Some(entry) = ep.sockets.get_mut(&token) {
                    if matches!(entry.state, SocketState::Connected | SocketState::Closing) {
                        entry.cond.readable = true;
                        ep.events.push_back(SocketEvent::Readable {
                            socket: SocketId(token),
                        });
                    }
                }
            });
        }

        if outcome.closed || (delayed_close && !buffered && outcome.n == 0 && outcome.would_block)
        {
            self.release(token);
        }
        Ok(outcome.n)
    }

    /// Writes plaintext to a connected socket. Returns bytes accepted.
    pub fn write(&mut self, id: SocketId, data: &[u8]) -> Result<usize, NetError> {
        let token = id.0;
        let entry = self.sockets.get_mut(&token).ok_or(NetError::NotConnected)?;
        match entry.state {
            SocketState::Connected => {}
            SocketState::Closing | SocketState::Closed => return Err(NetError::Closed),
            _ => return Err(NetError::NotConnected),
        }
        let pipeline = entry.pipeline.as_mut().ok_or(NetError::NotConnected)?;
        let (group_in, group_out) = match entry.group {
            Some(gid) => match self.groups.get_mut(&gid.0) {
                Some(group) => (Some(&mut group.throttle_in), Some(&mut group.throttle_out)),
                None => (None, None),
            },
            None => (None, None),
        };

        let outcome = pipeline.write(group_in, group_out, data)?;

        if outcome.accepted > 0 {
            self.metrics.bytes_out.inc_by(outcome.accepted as u64);
        }
        if outcome.would_block {
            entry.cond.writable = false;
        }
        let priority = entry.actual_priority;
        if let Some(delay) = outcome.delay {
            self.metrics.throttle_stalls.inc();
            self.sched.post_after(delay, priority, move |ep| {
                if let Some(entry) = ep.sockets.get_mut(&token) {
                    if entry.state == SocketState::Connected {
                        entry.cond.writable = true;
                        let _ = ep.flush_socket(token);
                        ep.events.push_back(SocketEvent::Writable {
                            socket: SocketId(token),
                        });
                    }
                }
            });
        }
        Ok(outcome.accepted)
    }

    /// Pushes bytes back into the buffered layer; the next read returns them
    /// first, in order.
    pub fn unread(&mut self, id: SocketId, data: &[u8]) -> Result<(), NetError> {
        let entry = self.entry_mut(id)?;
        let pipeline = entry.pipeline.as_mut().ok_or(NetError::NotConnected)?;
        pipeline.unread(data);
        Ok(())
    }

    fn flush_socket(&mut self, token: u64) -> Result<(), NetError> {
        let Some(entry) = self.sockets.get_mut(&token) else {
            return Ok(());
        };
        let Some(pipeline) = entry.pipeline.as_mut() else {
            return Ok(());
        };
        let (group_in, group_out) = match entry.group {
            Some(gid) => match self.groups.get_mut(&gid.0) {
                Some(group) => (Some(&mut group.throttle_in), Some(&mut group.throttle_out)),
                None => (None, None),
            },
            None => (None, None),
        };
        let outcome = pipeline.flush(group_in, group_out)?;
        if outcome.would_block {
            entry.cond.writable = false;
        }
        let priority = entry.actual_priority;
        if let Some(delay) = outcome.delay {
            self.sched.post_after(delay, priority, move |ep| {
                let _ = ep.flush_socket(token);
                if let Some(entry) = ep.sockets.get(&token) {
                    if entry.state == SocketState::Closing {
                        ep.continue_close(token);
                    }
                }
            });
        }
        Ok(())
    }

    // ---- TLS ------------------------------------------------------------

    /// Inserts the TLS layer and starts handshaking.
    pub fn starttls(&mut self, id: SocketId, mode: TlsMode) -> Result<(), NetError> {
        let token = id.0;
        let entry = self.entry(id)?;
        if !matches!(
            entry.state,
            SocketState::Connected | SocketState::TlsHandshaking
        ) {
            return Err(NetError::NotConnected);
        }
        if entry
            .pipeline
            .as_ref()
            .map(|p| p.has_tls())
            .unwrap_or(false)
        {
            return Err(NetError::AlreadyActive);
        }
        let creds = entry
            .tls_creds
            .clone()
            .ok_or_else(|| NetError::TlsHandshake("no credentials attached".into()))?;
        let session = match mode {
            TlsMode::Client => {
                let host = entry
                    .connect_host
                    .clone()
                    .unwrap_or_else(|| "localhost".to_string());
                TlsSession::client(&creds, &host)?
            }
            TlsMode::Server => TlsSession::server(&creds)?,
        };
        let entry = self.entry_mut(id)?;
        let pipeline = entry.pipeline.as_mut().ok_or(NetError::NotConnected)?;
        pipeline.start_tls(session)?;
        self.set_state(token, SocketState::TlsHandshaking);
        self.drive_handshake(token);
        Ok(())
    }

    fn drive_handshake(&mut self, token: u64) {
        let Some(entry) = self.sockets.get_mut(&token) else {
            return;
        };
        if entry.state != SocketState::TlsHandshaking {
            return;
        }
        let Some(pipeline) = entry.pipeline.as_mut() else {
            return;
        };
        let (group_in, group_out) = match entry.group {
            Some(gid) => match self.groups.get_mut(&gid.0) {
                Some(group) => (Some(&mut group.throttle_in), Some(&mut group.throttle_out)),
                None => (None, None),
            },
            None => (None, None),
        };

        match pipeline.handshake(group_in, group_out) {
            Ok(HandshakeStatus::Done) => {
                self.metrics.tls_handshakes.inc();
                self.set_state(token, SocketState::Connected);
                if let Some(entry) = self.sockets.get_mut(&token) {
                    entry.cond.writable = true;
                }
                self.events.push_back(SocketEvent::Writable {
                    socket: SocketId(token),
                });
            }
            Ok(HandshakeStatus::WantRead) => {
                entry.cond.readable = false;
            }
            Ok(HandshakeStatus::WantWrite) => {
                entry.cond.writable = false;
            }
            Err(error) => {
                self.metrics.tls_failures.inc();
                self.events.push_back(SocketEvent::Error {
                    socket: SocketId(token),
                    error,
                });
                self.release(token);
            }
        }
    }

    /// Shuts down the write direction; TLS sessions close their write side
    /// before the socket's.
    pub fn shutdown_write(&mut self, id: SocketId) -> Result<(), NetError> {
        let entry = self.entry_mut(id)?;
        if entry.state != SocketState::Connected {
            return Err(NetError::NotConnected);
        }
        let pipeline = entry.pipeline.as_mut().ok_or(NetError::NotConnected)?;
        pipeline.tls_shutdown_write()?;
        pipeline.socket().shutdown(std::net::Shutdown::Write)?;
        Ok(())
    }

    // ---- close path -----------------------------------------------------

    /// Starts an orderly close: TLS bye when applicable, flush buffered
    /// output, then release the handle and emit `Closed` exactly once.
    pub fn close(&mut self, id: SocketId) -> Result<(), NetError> {
        let token = id.0;
        let Some(entry) = self.sockets.get_mut(&token) else {
            return Ok(());
        };
        match entry.state {
            SocketState::Closed | SocketState::Closing => Ok(()),
            SocketState::Resolving | SocketState::Connecting => {
                self.abort_pending(token);
                self.release(token);
                Ok(())
            }
            SocketState::Bound | SocketState::Listening => {
                self.release(token);
                Ok(())
            }
            SocketState::Connected | SocketState::TlsHandshaking => {
                self.set_state(token, SocketState::Closing);
                let entry = self.sockets.get_mut(&token).expect("entry");
                if let Some(pipeline) = entry.pipeline.as_mut() {
                    let _ = pipeline.tls_bye();
                }
                self.continue_close(token);
                Ok(())
            }
        }
    }

    fn continue_close(&mut self, token: u64) {
        let _ = self.flush_socket(token);
        let drained = self
            .sockets
            .get(&token)
            .and_then(|e| e.pipeline.as_ref())
            .map(|p| !p.has_pending_output())
            .unwrap_or(true);
        if drained {
            self.release(token);
        }
    }

    /// Releases the OS handle, unwatches, and emits the close notification.
    fn release(&mut self, token: u64) {
        let Some(entry) = self.sockets.get_mut(&token) else {
            return;
        };
        if let Some((rid, cancel)) = entry.resolve.take() {
            cancel.cancel();
            self.resolving.remove(&rid);
        }
        if let Some(task) = entry.timeout_task.take() {
            task.cancel();
        }
        let had_handle = entry.os.is_some() || entry.pipeline.is_some();
        if let Some(sock) = entry.os.take() {
            self.reactor.remove(sock.as_fd(), token);
        }
        if let Some(pipeline) = entry.pipeline.take() {
            self.reactor.remove(pipeline.socket().as_fd(), token);
        }
        entry.watched = Interest::default();
        entry.cond = Readiness::default();
        entry.delayed_close = false;
        entry.intent = None;

        self.set_state(token, SocketState::Closed);
        let entry = self.sockets.get_mut(&token).expect("entry");
        if had_handle && !entry.close_emitted {
            entry.close_emitted = true;
            self.metrics.sockets_closed.inc();
            self.events.push_back(SocketEvent::Closed {
                socket: SocketId(token),
            });
        }
    }

    fn set_state(&mut self, token: u64, new: SocketState) {
        let Some(entry) = self.sockets.get_mut(&token) else {
            return;
        };
        let old = entry.state;
        if old == new {
            return;
        }
        entry.state = new;
        self.events.push_back(SocketEvent::StateChanged {
            socket: SocketId(token),
            old,
            new,
        });
    }

    // ---- the loop -------------------------------------------------------

    /// Runs one iteration: drains readiness, finishes resolutions, fires due
    /// tasks, and returns the ordered event batch.
    pub fn run_once(&mut self, timeout: Duration) -> Result<Vec<SocketEvent>, NetError> {
        self.pump_resolver();

        let now = Instant::now();
        let mut wait = timeout;
        if !self.events.is_empty() || self.sched.has_ready(now) {
            wait = Duration::ZERO;
        } else {
            if let Some(due) = self.sched.next_due() {
                wait = wait.min(due.saturating_duration_since(now));
            }
            if self.resolver.pending() > 0 {
                wait = wait.min(Duration::from_millis(10));
            }
        }

        let mut ready = Vec::new();
        match &self.reactor_rx {
            Some(rx) => {
                match rx.recv_timeout(wait) {
                    Ok(event) => {
                        ready.push(event);
                        ready.extend(rx.try_iter());
                    }
                    Err(_timeout) => {}
                }
            }
            None => self.reactor.poll_into(&mut ready, Some(wait))?,
        }
        for event in ready {
            self.process_readiness(event);
        }

        self.pump_resolver();

        let now = Instant::now();
        while let Some(task) = self.sched.pop_ready(now) {
            task(self);
        }

        Ok(self.events.drain(..).collect())
    }

    /// Convenience wrapper: one short iteration.
    pub fn drive(&mut self) -> Result<Vec<SocketEvent>, NetError> {
        self.run_once(Duration::from_millis(20))
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.reactor.shutdown();
        if let Some(join) = self.reactor_thread.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive_until<F>(ep: &mut Endpoint, deadline: Duration, mut stop: F) -> Vec<SocketEvent>
    where
        F: FnMut(&SocketEvent) -> bool,
    {
        let mut collected = Vec::new();
        let end = Instant::now() + deadline;
        let mut done = false;
        while !done && Instant::now() < end {
            for event in ep.drive().expect("drive") {
                if stop(&event) {
                    done = true;
                }
                collected.push(event);
            }
        }
        collected
    }

    fn listening_socket(ep: &mut Endpoint) -> (SocketId, std::net::SocketAddr) {
        let server = ep.socket(Family::Ipv4);
        ep.listen(server, "127.0.0.1:0").expect("listen");
        drive_until(ep, Duration::from_secs(2), |event| {
            matches!(
                event,
                SocketEvent::StateChanged {
                    new: SocketState::Listening,
                    ..
                }
            )
        });
        let addr = ep.local_addr(server).expect("listener addr");
        (server, addr)
    }

    #[test]
    fn listener_reaches_listening_through_resolving() {
        let mut ep = Endpoint::new().expect("endpoint");
        let server = ep.socket(Family::Ipv4);
        ep.listen(server, "127.0.0.1:0").expect("listen");

        let events = drive_until(&mut ep, Duration::from_secs(2), |event| {
            matches!(
                event,
                SocketEvent::StateChanged {
                    new: SocketState::Listening,
                    ..
                }
            )
        });

        let states: Vec<SocketState> = events
            .iter()
            .filter_map(|e| match e {
                SocketEvent::StateChanged { new, .. } => Some(*new),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![SocketState::Resolving, SocketState::Listening]);
        // Listening sockets watch at elevated priority.
        assert!(ep.priority(server).expect("priority") < PRIORITY_DEFAULT);
    }

    #[test]
    fn second_connect_on_same_socket_is_already_active() {
        let mut ep = Endpoint::new().expect("endpoint");
        let (_server, addr) = listening_socket(&mut ep);
        let client = ep.socket(Family::Ipv4);
        ep.connect(client, &addr.to_string()).expect("connect");
        assert!(matches!(
            ep.connect(client, &addr.to_string()),
            Err(NetError::AlreadyActive)
        ));
    }

    #[test]
    fn echo_roundtrip_and_single_close_each_side() {
        let mut ep = Endpoint::new().expect("endpoint");
        let (server, addr) = listening_socket(&mut ep);

        let client = ep.socket(Family::Ipv4);
        ep.connect(client, &addr.to_string()).expect("connect");

        let mut accepted = None;
        drive_until(&mut ep, Duration::from_secs(2), |event| {
            if let SocketEvent::NewConnection {
                listener,
                accepted: a,
            } = event
            {
                assert_eq!(*listener, server);
                accepted = Some(*a);
            }
            accepted.is_some() && matches!(event, SocketEvent::NewConnection { .. })
        });
        let accepted = accepted.expect("accepted socket");
        assert_eq!(ep.state(accepted), SocketState::Connected);

        let end = Instant::now() + Duration::from_secs(2);
        while ep.state(client) != SocketState::Connected && Instant::now() < end {
            let _ = ep.drive().expect("drive");
        }
        assert_eq!(ep.state(client), SocketState::Connected);
        // Priority restored after the connect bump.
        assert_eq!(ep.priority(client).expect("priority"), PRIORITY_DEFAULT);

        ep.write(client, b"hello").expect("client write");
        drive_until(&mut ep, Duration::from_secs(2), |event| {
            matches!(event, SocketEvent::Readable { socket } if *socket == accepted)
        });

        let mut buf = [0u8; 16];
        let n = ep.read(accepted, &mut buf).expect("server read");
        assert_eq!(&buf[..n], b"hello");

        ep.write(accepted, &buf[..n]).expect("server echo");
        drive_until(&mut ep, Duration::from_secs(2), |event| {
            matches!(event, SocketEvent::Readable { socket } if *socket == client)
        });
        let n = ep.read(client, &mut buf).expect("client read");
        assert_eq!(&buf[..n], b"hello");

        // Graceful close: each side emits Closed exactly once.
        ep.close(client).expect("close client");
        let mut client_closed = 0;
        let mut accepted_closed = 0;
        let events = drive_until(&mut ep, Duration::from_secs(3), |event| {
            matches!(event, SocketEvent::Closed { socket } if *socket == accepted)
        });
        for event in &events {
            match event {
                SocketEvent::Closed { socket } if *socket == client => client_closed += 1,
                SocketEvent::Closed { socket } if *socket == accepted => accepted_closed += 1,
                _ => {}
            }
        }
        // The accepted side may need one more read to observe the EOF.
        if accepted_closed == 0 {
            let n = ep.read(accepted, &mut buf).unwrap_or(0);
            assert_eq!(n, 0);
            let events = drive_until(&mut ep, Duration::from_secs(2), |event| {
                matches!(event, SocketEvent::Closed { socket } if *socket == accepted)
            });
            accepted_closed += events
                .iter()
                .filter(
                    |e| matches!(e, SocketEvent::Closed { socket } if *socket == accepted),
                )
                .count();
        }
        assert_eq!(client_closed, 1);
        assert_eq!(accepted_closed, 1);
        assert_eq!(ep.state(client), SocketState::Closed);
        assert_eq!(ep.state(accepted), SocketState::Closed);
    }

    #[test]
    fn connect_to_dead_port_reports_refused() {
        let mut ep = Endpoint::new().expect("endpoint");
        // Bind then drop a listener to find a port that is closed.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe");
        let addr = probe.local_addr().expect("addr");
        drop(probe);

        let client = ep.socket(Family::Ipv4);
        ep.connect(client, &addr.to_string()).expect("connect");

        let events = drive_until(&mut ep, Duration::from_secs(3), |event| {
            matches!(event, SocketEvent::Closed { socket } if *socket == client)
                || matches!(event, SocketEvent::Error { .. })
        });
        assert!(events
            .iter()
            .any(|e| matches!(e, SocketEvent::Error { .. })));
        assert_eq!(ep.state(client), SocketState::Closed);
    }

    #[test]
    fn cancel_connect_requires_connecting_state() {
        let mut ep = Endpoint::new().expect("endpoint");
        let sock = ep.socket(Family::Ipv4);
        assert!(matches!(
            ep.cancel_connect(sock),
            Err(NetError::NotConnected)
        ));

        let (_server, addr) = listening_socket(&mut ep);
        ep.connect(sock, &addr.to_string()).expect("connect");
        ep.cancel_connect(sock).expect("cancel");
        assert_eq!(ep.state(sock), SocketState::Closed);
    }

    #[test]
    fn family_mismatch_resolves_to_invalid_address() {
        let mut ep = Endpoint::new().expect("endpoint");
        let sock = ep.socket(Family::Ipv6);
        ep.connect(sock, "127.0.0.1:9").expect("connect starts");

        let events = drive_until(&mut ep, Duration::from_secs(2), |event| {
            matches!(event, SocketEvent::Error { .. })
        });
        assert!(events.iter().any(|e| matches!(
            e,
            SocketEvent::Error {
                error: NetError::InvalidAddress(_),
                ..
            }
        )));
        assert_eq!(ep.state(sock), SocketState::Closed);
    }

    #[test]
    fn read_on_unconnected_socket_fails() {
        let mut ep = Endpoint::new().expect("endpoint");
        let sock = ep.socket(Family::Ipv4);
        let mut buf = [0u8; 4];
        assert!(matches!(
            ep.read(sock, &mut buf),
            Err(NetError::NotConnected)
        ));
        assert!(matches!(
            ep.write(sock, b"x"),
            Err(NetError::NotConnected)
        ));
    }

    #[test]
    fn unread_then_read_returns_bytes_first() {
        let mut ep = Endpoint::new().expect("endpoint");
        let (_server, addr) = listening_socket(&mut ep);
        let client = ep.socket(Family::Ipv4);
        ep.connect(client, &addr.to_string()).expect("connect");
        drive_until(&mut ep, Duration::from_secs(2), |event| {
            matches!(event, SocketEvent::StateChanged { socket, new: SocketState::Connected, .. } if *socket == client)
        });

        ep.unread(client, b"prefix").expect("unread");
        let mut buf = [0u8; 6];
        let n = ep.read(client, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"prefix");
    }

    #[test]
    fn throttled_server_reads_in_capped_chunks() {
        let mut ep = Endpoint::new().expect("endpoint");
        let (_server, addr) = listening_socket(&mut ep);

        let client = ep.socket(Family::Ipv4);
        ep.connect(client, &addr.to_string()).expect("connect");

        let mut accepted = None;
        drive_until(&mut ep, Duration::from_secs(2), |event| {
            if let SocketEvent::NewConnection { accepted: a, .. } = event {
                accepted = Some(*a);
                true
            } else {
                false
            }
        });
        let accepted = accepted.expect("accepted");
        ep.set_bandwidth(accepted, 1024, 0).expect("throttle");

        let end = Instant::now() + Duration::from_secs(2);
        while ep.state(client) != SocketState::Connected && Instant::now() < end {
            let _ = ep.drive().expect("drive");
        }
        assert_eq!(ep.state(client), SocketState::Connected);

        let payload = vec![0x5a_u8; 3072];
        let mut written = 0;
        while written < payload.len() {
            written += ep.write(client, &payload[written..]).expect("write");
            let _ = ep.drive().expect("drive");
        }

        let started = Instant::now();
        let mut total = 0;
        let mut chunks = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while total < payload.len() && Instant::now() < deadline {
            let _ = ep.drive().expect("drive");
            let mut buf = [0u8; 4096];
            let n = ep.read(accepted, &mut buf).expect("read");
            if n > 0 {
                chunks.push(n);
                total += n;
            }
        }
        assert_eq!(total, payload.len());
        assert!(chunks.iter().all(|&n| n <= 1024), "chunks: {chunks:?}");
        // 3072 bytes at 1024 B/s require at least two extra second windows.
        assert!(
            started.elapsed() >= Duration::from_millis(1500),
            "elapsed: {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn close_group_closes_every_member() {
        let mut ep = Endpoint::new().expect("endpoint");
        let (_server, addr) = listening_socket(&mut ep);
        let group = ep.create_group();

        let a = ep.socket(Family::Ipv4);
        let b = ep.socket(Family::Ipv4);
        ep.set_group(a, Some(group)).expect("group a");
        ep.set_group(b, Some(group)).expect("group b");
        ep.connect(a, &addr.to_string()).expect("connect a");
        ep.connect(b, &addr.to_string()).expect("connect b");
        drive_until(&mut ep, Duration::from_secs(2), |event| {
            matches!(event, SocketEvent::StateChanged { socket, new: SocketState::Connected, .. } if *socket == b)
        });

        ep.close_group(group);
        let _ = drive_until(&mut ep, Duration::from_secs(1), |_| false);
        assert_eq!(ep.state(a), SocketState::Closed);
        assert_eq!(ep.state(b), SocketState::Closed);
    }

    #[test]
    fn starttls_without_connection_fails() {
        let mut ep = Endpoint::new().expect("endpoint");
        let sock = ep.socket(Family::Ipv4);
        assert!(matches!(
            ep.starttls(sock, TlsMode::Client),
            Err(NetError::NotConnected)
        ));
    }

    #[test]
    fn starttls_twice_is_already_active() {
        let mut ep = Endpoint::new().expect("endpoint");
        let (_server, addr) = listening_socket(&mut ep);
        let client = ep.socket(Family::Ipv4);
        ep.set_tls_credentials(client, Rc::new(TlsCredentials::new()))
            .expect("creds");
        ep.connect(client, &addr.to_string()).expect("connect");
        drive_until(&mut ep, Duration::from_secs(2), |event| {
            matches!(event, SocketEvent::StateChanged { socket, new: SocketState::Connected, .. } if *socket == client)
        });

        ep.starttls(client, TlsMode::Client).expect("first starttls");
        assert!(matches!(
            ep.starttls(client, TlsMode::Client),
            Err(NetError::AlreadyActive)
        ));
    }

    #[test]
    fn accepted_sockets_inherit_listener_properties() {
        let mut ep = Endpoint::new().expect("endpoint");
        let server = ep.socket(Family::Ipv4);
        ep.set_priority(server, 7).expect("priority");
        ep.set_bandwidth(server, 2048, 0).expect("bandwidth");
        let group = ep.create_group();
        ep.set_group(server, Some(group)).expect("group");
        ep.listen(server, "127.0.0.1:0").expect("listen");
        drive_until(&mut ep, Duration::from_secs(2), |event| {
            matches!(
                event,
                SocketEvent::StateChanged {
                    new: SocketState::Listening,
                    ..
                }
            )
        });
        let addr = ep.local_addr(server).expect("addr");

        let client = ep.socket(Family::Ipv4);
        ep.connect(client, &addr.to_string()).expect("connect");
        let mut accepted = None;
        drive_until(&mut ep, Duration::from_secs(2), |event| {
            if let SocketEvent::NewConnection { accepted: a, .. } = event {
                accepted = Some(*a);
                true
            } else {
                false
            }
        });
        let accepted = accepted.expect("accepted");
        assert_eq!(ep.priority(accepted).expect("priority"), 7);
        let entry = ep.sockets.get(&accepted.0).expect("entry");
        assert_eq!(entry.bandwidth_in, 2048);
        assert_eq!(entry.group, Some(group));
    }
}
