// Byte-message delivery between peers, independent of the carrier.
// Numan Thabit 2026

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    config::Config,
    error::NetError,
    peer::{PeerCloseState, PeerId, SharedPeerManager},
    resolver::Family,
    socket::{Endpoint, SocketEvent, SocketId, SocketState},
};

/// Events a transport surfaces to the layers above it.
#[derive(Debug)]
pub enum TransportEvent {
    /// A new endpoint was recognized and registered.
    NewPeer { peer: PeerId },
    /// One inbound message. Consumers that retain the bytes keep this
    /// `Bytes` handle; nothing else refers to the payload afterwards.
    Receive { peer: PeerId, frame: Bytes },
    /// The peer finished closing, gracefully or not.
    PeerClosed { peer: PeerId, graceful: bool },
}

/// Decodes a received frame as UTF-8 text, allocating a copy.
pub fn receive_text(frame: &Bytes) -> Result<String, NetError> {
    std::str::from_utf8(frame)
        .map(|s| s.to_string())
        .map_err(|_| NetError::ProtocolViolation("frame is not valid utf-8".into()))
}

/// A byte-message carrier between peers. Delivery is at-most-once per
/// message; concrete transports may layer retries above this contract but
/// the core never mandates them.
///
/// Peers live in the process-wide registry (see
/// [`SharedPeerManager::process_default`]); each carries its creating
/// transport's tag so sweeps stay scoped to the transport that can answer
/// for its connectivity. The provided methods implement the shared peer
/// bookkeeping: backlog on send failure, graceful/abrupt close, and the
/// periodic dead-peer sweep. They take the registry lock only for individual
/// operations, never across carrier I/O.
pub trait Transport {
    /// Attempts to put one framed message on the wire right now.
    fn send_frame(&mut self, peer: PeerId, frame: Bytes) -> Result<(), NetError>;

    /// Whether the transport currently holds an open channel to the peer.
    fn peer_is_connected(&self, peer: PeerId) -> bool;

    /// The (usually process-wide) peer registry backing this transport.
    fn peer_manager(&self) -> &SharedPeerManager;

    /// Tag identifying this transport instance inside the shared registry.
    fn transport_tag(&self) -> u64;

    /// The transport's outbound event queue.
    fn events(&mut self) -> &mut VecDeque<TransportEvent>;

    /// Sends the transport's close notification frame, if it has one.
    fn send_close_frame(&mut self, _peer: PeerId) -> Result<(), NetError> {
        Ok(())
    }

    /// Hook invoked after a peer finished closing.
    fn peer_closed(&mut self, _peer: PeerId, _graceful: bool) {}

    /// Registers a new peer under this transport's tag and announces it.
    fn create_new_peer(&mut self) -> PeerId {
        let id = self.peer_manager().create_peer(self.transport_tag());
        self.events().push_back(TransportEvent::NewPeer { peer: id });
        id
    }

    /// Sends `payload` to the peer; when no channel is open the frame lands
    /// in the peer's ordered backlog for the next flush.
    fn send(&mut self, peer: PeerId, payload: Bytes) -> Result<(), NetError> {
        match self.send_frame(peer, payload.clone()) {
            Ok(()) => {
                if let Some(p) = self.peer_manager().lock().get_mut(peer) {
                    p.touch();
                }
                Ok(())
            }
            Err(err) => {
                debug!(peer = %peer, ?err, "send failed; parking frame in backlog");
                self.peer_manager()
                    .lock()
                    .get_mut(peer)
                    .ok_or(NetError::Closed)?
                    .backlog_push(payload)
            }
        }
    }

    /// UTF-8 convenience wrapper over [`Transport::send`].
    fn send_text(&mut self, peer: PeerId, text: &str) -> Result<(), NetError> {
        self.send(peer, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Pushes parked frames onto the wire until one fails again.
    fn flush_backlog(&mut self, peer: PeerId) -> Result<(), NetError> {
        loop {
            let frame = self
                .peer_manager()
                .lock()
                .get_mut(peer)
                .and_then(|p| p.backlog_pop());
            let Some(frame) = frame else {
                return Ok(());
            };
            if let Err(err) = self.send_frame(peer, frame.clone()) {
                if let Some(p) = self.peer_manager().lock().get_mut(peer) {
                    p.backlog_unshift(frame);
                }
                return Err(err);
            }
            if let Some(p) = self.peer_manager().lock().get_mut(peer) {
                p.touch();
            }
        }
    }

    /// Inbound dispatch: records activity and queues the receive event.
    fn deliver(&mut self, peer: PeerId, frame: Bytes) {
        if let Some(p) = self.peer_manager().lock().get_mut(peer) {
            p.touch();
        }
        self.events()
            .push_back(TransportEvent::Receive { peer, frame });
    }

    /// Closes a peer. Graceful closes flush the backlog and send the close
    /// frame; abrupt ones discard the backlog. Idempotent.
    fn close_peer(&mut self, peer: PeerId, graceful: bool) -> Result<(), NetError> {
        let state = match self.peer_manager().lock().get(peer) {
            Some(p) => p.close_state(),
            None => return Ok(()),
        };
        if state != PeerCloseState::Open {
            return Ok(());
        }

        if graceful {
            if let Some(p) = self.peer_manager().lock().get_mut(peer) {
                p.mark_closing();
            }
            if let Err(err) = self.flush_backlog(peer) {
                warn!(peer = %peer, ?err, "backlog flush during close failed");
            }
            let _ = self.send_close_frame(peer);
        } else if let Some(p) = self.peer_manager().lock().get_mut(peer) {
            p.backlog_clear();
        }

        {
            let mut registry = self.peer_manager().lock();
            if let Some(p) = registry.get_mut(peer) {
                p.mark_closed();
            }
            registry.remove(peer);
        }
        self.peer_closed(peer, graceful);
        self.events()
            .push_back(TransportEvent::PeerClosed { peer, graceful });
        Ok(())
    }

    /// Runs the registry's periodic sweep over this transport's peers,
    /// emitting `PeerClosed` for every expired one. Peers owned by other
    /// transports sharing the registry are untouched.
    fn sweep_peers(&mut self) {
        let tag = self.transport_tag();
        let ids = self.peer_manager().lock().ids_owned(tag);
        let connected: AHashSet<PeerId> = ids
            .into_iter()
            .filter(|&id| self.peer_is_connected(id))
            .collect();
        let removed = self
            .peer_manager()
            .lock()
            .maybe_sweep(tag, |peer| connected.contains(&peer.id()));
        for peer in removed {
            let id = peer.id();
            self.peer_closed(id, false);
            self.events().push_back(TransportEvent::PeerClosed {
                peer: id,
                graceful: false,
            });
        }
    }

    /// Takes the next queued transport event.
    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events().pop_front()
    }
}

/// Length-prefixed frame header size: one big-endian u32.
const FRAME_HEADER: usize = 4;

/// A zero-length frame signals a graceful close.
const CLOSE_FRAME: [u8; FRAME_HEADER] = [0, 0, 0, 0];

const READ_CHUNK: usize = 4096;

/// Transport carrying framed messages over the socket substrate: every
/// peer maps to one connected stream socket, and each message travels as a
/// `u32` big-endian length prefix followed by the payload.
pub struct SocketTransport {
    endpoint: Endpoint,
    manager: SharedPeerManager,
    tag: u64,
    events: VecDeque<TransportEvent>,
    by_peer: AHashMap<PeerId, SocketId>,
    by_socket: AHashMap<SocketId, PeerId>,
    rx: AHashMap<PeerId, Vec<u8>>,
}

impl SocketTransport {
    /// Creates the transport with its own event loop, registered against
    /// the process-wide peer registry.
    pub fn new(config: &Config) -> Result<Self, NetError> {
        Self::with_peer_manager(SharedPeerManager::process_default(&config.peers))
    }

    /// Creates the transport against an explicit registry handle.
    pub fn with_peer_manager(manager: SharedPeerManager) -> Result<Self, NetError> {
        Ok(Self {
            endpoint: Endpoint::new()?,
            manager,
            tag: rand::random(),
            events: VecDeque::new(),
            by_peer: AHashMap::new(),
            by_socket: AHashMap::new(),
            rx: AHashMap::new(),
        })
    }

    /// The loop this transport drives.
    pub fn endpoint(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    /// Starts listening; accepted connections become peers.
    pub fn listen(&mut self, address: &str) -> Result<SocketId, NetError> {
        let listener = self.endpoint.socket(Family::Any);
        self.endpoint.listen(listener, address)?;
        Ok(listener)
    }

    /// Opens an outbound channel and registers the peer for it. Frames sent
    /// before the connection establishes wait in the peer's backlog.
    pub fn connect_peer(&mut self, address: &str) -> Result<PeerId, NetError> {
        let socket = self.endpoint.socket(Family::Any);
        self.endpoint.connect(socket, address)?;
        let peer = self.create_new_peer();
        self.by_peer.insert(peer, socket);
        self.by_socket.insert(socket, peer);
        self.endpoint.metrics().peers_created.inc();
        Ok(peer)
    }

    /// The socket currently bound to a peer.
    pub fn socket_for(&self, peer: PeerId) -> Option<SocketId> {
        self.by_peer.get(&peer).copied()
    }

    fn bind_accepted(&mut self, socket: SocketId) {
        let peer = self.create_new_peer();
        self.by_peer.insert(peer, socket);
        self.by_socket.insert(socket, peer);
        self.endpoint.metrics().peers_created.inc();
    }

    fn pump_socket_readable(&mut self, socket: SocketId) {
        let Some(&peer) = self.by_socket.get(&socket) else {
            return;
        };
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            match self.endpoint.read(socket, &mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.rx.entry(peer).or_default().extend_from_slice(&chunk[..n]);
                }
                Err(_) => break,
            }
        }
        self.extract_frames(peer);
    }

    fn extract_frames(&mut self, peer: PeerId) {
        loop {
            let (frame, graceful_close) = {
                let Some(buf) = self.rx.get_mut(&peer) else {
                    return;
                };
                if buf.len() < FRAME_HEADER {
                    return;
                }
                let len =
                    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                if len == 0 {
                    buf.drain(..FRAME_HEADER);
                    (None, true)
                } else if buf.len() >= FRAME_HEADER + len {
                    let frame =
                        Bytes::copy_from_slice(&buf[FRAME_HEADER..FRAME_HEADER + len]);
                    buf.drain(..FRAME_HEADER + len);
                    (Some(frame), false)
                } else {
                    return;
                }
            };

            if graceful_close {
                let _ = self.close_peer(peer, true);
                self.detach(peer);
                return;
            }
            if let Some(frame) = frame {
                self.deliver(peer, frame);
            }
        }
    }

    fn detach(&mut self, peer: PeerId) {
        if let Some(socket) = self.by_peer.remove(&peer) {
            self.by_socket.remove(&socket);
            let _ = self.endpoint.close(socket);
        }
        self.rx.remove(&peer);
    }

    /// Drives the loop one step, translating socket events into transport
    /// events. Call repeatedly.
    pub fn pump(&mut self) -> Result<(), NetError> {
        let events = self.endpoint.drive()?;
        for event in events {
            match event {
                SocketEvent::NewConnection { accepted, .. } => {
                    self.bind_accepted(accepted);
                }
                SocketEvent::Readable { socket } => {
                    self.pump_socket_readable(socket);
                }
                SocketEvent::Writable { socket } => {
                    if let Some(&peer) = self.by_socket.get(&socket) {
                        let _ = self.flush_backlog(peer);
                    }
                }
                SocketEvent::Closed { socket } => {
                    if let Some(&peer) = self.by_socket.get(&socket) {
                        // The carrier vanished under the peer.
                        let _ = self.close_peer(peer, false);
                        self.detach(peer);
                    }
                }
                SocketEvent::Error { socket, error } => {
                    debug!(?socket, ?error, "socket error under transport");
                }
                _ => {}
            }
        }
        self.sweep_peers();
        Ok(())
    }
}

impl Transport for SocketTransport {
    fn send_frame(&mut self, peer: PeerId, frame: Bytes) -> Result<(), NetError> {
        let socket = *self.by_peer.get(&peer).ok_or(NetError::NotConnected)?;
        if self.endpoint.state(socket) != SocketState::Connected {
            return Err(NetError::NotConnected);
        }
        let header = (frame.len() as u32).to_be_bytes();
        let mut message = Vec::with_capacity(FRAME_HEADER + frame.len());
        message.extend_from_slice(&header);
        message.extend_from_slice(&frame);

        let mut written = 0;
        while written < message.len() {
            let n = self.endpoint.write(socket, &message[written..])?;
            if n == 0 {
                // The pipeline refused mid-frame; the stream is unusable.
                return Err(NetError::NotWritable);
            }
            written += n;
        }
        Ok(())
    }

    fn peer_is_connected(&self, peer: PeerId) -> bool {
        self.by_peer
            .get(&peer)
            .map(|&socket| {
                matches!(
                    self.endpoint.state(socket),
                    SocketState::Connected | SocketState::TlsHandshaking
                )
            })
            .unwrap_or(false)
    }

    fn peer_manager(&self) -> &SharedPeerManager {
        &self.manager
    }

    fn transport_tag(&self) -> u64 {
        self.tag
    }

    fn events(&mut self) -> &mut VecDeque<TransportEvent> {
        &mut self.events
    }

    fn send_close_frame(&mut self, peer: PeerId) -> Result<(), NetError> {
        let socket = *self.by_peer.get(&peer).ok_or(NetError::NotConnected)?;
        let mut written = 0;
        while written < CLOSE_FRAME.len() {
            let n = self.endpoint.write(socket, &CLOSE_FRAME[written..])?;
            if n == 0 {
                return Err(NetError::NotWritable);
            }
            written += n;
        }
        Ok(())
    }

    fn peer_closed(&mut self, peer: PeerId, _graceful: bool) {
        if let Some(socket) = self.by_peer.get(&peer).copied() {
            let _ = self.endpoint.close(socket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerSettings;
    use std::time::{Duration, Instant};

    /// In-memory transport in the spirit of the socket one, with a channel
    /// that can be opened and closed at will.
    struct MockTransport {
        manager: SharedPeerManager,
        tag: u64,
        events: VecDeque<TransportEvent>,
        channel_open: bool,
        wire: Vec<(PeerId, Bytes)>,
        close_frames: Vec<PeerId>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                manager: SharedPeerManager::new(&PeerSettings::default()),
                tag: rand::random(),
                events: VecDeque::new(),
                channel_open: true,
                wire: Vec::new(),
                close_frames: Vec::new(),
            }
        }
    }

    impl Transport for MockTransport {
        fn send_frame(&mut self, peer: PeerId, frame: Bytes) -> Result<(), NetError> {
            if !self.channel_open {
                return Err(NetError::NotConnected);
            }
            self.wire.push((peer, frame));
            Ok(())
        }

        fn peer_is_connected(&self, _peer: PeerId) -> bool {
            self.channel_open
        }

        fn peer_manager(&self) -> &SharedPeerManager {
            &self.manager
        }

        fn transport_tag(&self) -> u64 {
            self.tag
        }

        fn events(&mut self) -> &mut VecDeque<TransportEvent> {
            &mut self.events
        }

        fn send_close_frame(&mut self, peer: PeerId) -> Result<(), NetError> {
            self.close_frames.push(peer);
            Ok(())
        }
    }

    #[test]
    fn failed_send_lands_in_backlog_and_flushes_later() {
        let mut transport = MockTransport::new();
        let peer = transport.create_new_peer();
        assert!(matches!(
            transport.poll_event(),
            Some(TransportEvent::NewPeer { .. })
        ));

        transport.channel_open = false;
        transport
            .send(peer, Bytes::from_static(b"queued"))
            .expect("send backlogs");
        assert!(transport.wire.is_empty());
        assert_eq!(
            transport
                .peer_manager()
                .lock()
                .get(peer)
                .expect("peer")
                .backlog_len(),
            1
        );

        transport.channel_open = true;
        transport.flush_backlog(peer).expect("flush");
        assert_eq!(transport.wire.len(), 1);
        assert_eq!(transport.wire[0].1.as_ref(), b"queued");
        assert_eq!(
            transport
                .peer_manager()
                .lock()
                .get(peer)
                .expect("peer")
                .backlog_len(),
            0
        );
    }

    #[test]
    fn graceful_close_flushes_and_sends_close_frame() {
        let mut transport = MockTransport::new();
        let peer = transport.create_new_peer();
        transport.channel_open = false;
        transport
            .send(peer, Bytes::from_static(b"pending"))
            .expect("backlog");
        transport.channel_open = true;

        transport.close_peer(peer, true).expect("close");
        assert_eq!(transport.wire.len(), 1, "backlog flushed before close");
        assert_eq!(transport.close_frames, vec![peer]);
        assert!(transport.peer_manager().lock().get(peer).is_none());

        let mut saw_closed = false;
        while let Some(event) = transport.poll_event() {
            if let TransportEvent::PeerClosed { peer: p, graceful } = event {
                assert_eq!(p, peer);
                assert!(graceful);
                saw_closed = true;
            }
        }
        assert!(saw_closed);

        // A second close is a no-op.
        transport.close_peer(peer, true).expect("idempotent close");
        assert!(transport.poll_event().is_none());
    }

    #[test]
    fn abrupt_close_discards_backlog() {
        let mut transport = MockTransport::new();
        let peer = transport.create_new_peer();
        transport.channel_open = false;
        transport
            .send(peer, Bytes::from_static(b"doomed"))
            .expect("backlog");

        transport.close_peer(peer, false).expect("close");
        assert!(transport.wire.is_empty());
        assert!(transport.close_frames.is_empty());
        let closed: Vec<_> = std::iter::from_fn(|| transport.poll_event())
            .filter(|e| matches!(e, TransportEvent::PeerClosed { graceful: false, .. }))
            .collect();
        assert_eq!(closed.len(), 1);
    }

    #[test]
    fn shared_registry_scopes_sweeps_to_each_transport() {
        // Two transports over one registry, the process-wide arrangement.
        let registry = SharedPeerManager::new(&PeerSettings {
            cleanup_interval_s: 3600,
            timeout_s: 60,
        });
        let mut first = MockTransport::new();
        first.manager = registry.clone();
        let mut second = MockTransport::new();
        second.manager = registry.clone();

        let a = first.create_new_peer();
        let b = second.create_new_peer();
        assert_ne!(a, b, "ids stay unique across transports");
        // Both peers are visible through either transport's registry handle.
        assert!(first.peer_manager().lock().get(b).is_some());
        assert!(second.peer_manager().lock().get(a).is_some());

        // A disconnected sweep on `first` must not reap `second`'s peer.
        first.channel_open = false;
        {
            let tag = first.transport_tag();
            let removed = registry.lock().force_sweep(tag, |_| false);
            // Peer `a` is still within its activity window, so it survives;
            // crucially nothing of `second`'s was touched either way.
            assert!(removed.iter().all(|p| p.owner() == tag));
        }
        assert!(registry.lock().get(b).is_some());
    }

    #[test]
    fn receive_text_copies_utf8() {
        let frame = Bytes::from_static(b"hola");
        assert_eq!(receive_text(&frame).expect("text"), "hola");
        let bad = Bytes::from_static(&[0xff, 0xfe]);
        assert!(matches!(
            receive_text(&bad),
            Err(NetError::ProtocolViolation(_))
        ));
    }

    fn pump_both(a: &mut SocketTransport, b: &mut SocketTransport) {
        a.pump().expect("pump a");
        b.pump().expect("pump b");
    }

    fn wait_event<F>(
        a: &mut SocketTransport,
        b: &mut SocketTransport,
        from_b: bool,
        mut pred: F,
    ) -> TransportEvent
    where
        F: FnMut(&TransportEvent) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            pump_both(a, b);
            let source = if from_b { &mut *b } else { &mut *a };
            let mut requeue = VecDeque::new();
            let mut found = None;
            while let Some(event) = source.poll_event() {
                if found.is_none() && pred(&event) {
                    found = Some(event);
                } else {
                    requeue.push_back(event);
                }
            }
            source.events().extend(requeue);
            if let Some(event) = found {
                return event;
            }
            assert!(Instant::now() < deadline, "event never arrived");
        }
    }

    #[test]
    fn framed_messages_travel_between_socket_transports() {
        // One registry for both ends, as in production where every
        // transport shares the process default.
        let registry = SharedPeerManager::new(&PeerSettings::default());
        let mut server =
            SocketTransport::with_peer_manager(registry.clone()).expect("server");
        let mut client =
            SocketTransport::with_peer_manager(registry.clone()).expect("client");

        let listener = server.listen("127.0.0.1:0").expect("listen");
        // Pump until the listener is up and an address is known.
        let deadline = Instant::now() + Duration::from_secs(2);
        let addr = loop {
            server.pump().expect("pump");
            if let Ok(addr) = server.endpoint.local_addr(listener) {
                break addr;
            }
            assert!(Instant::now() < deadline);
        };

        let peer_on_client = client.connect_peer(&addr.to_string()).expect("connect");
        // Queue a message immediately; it flushes once connected.
        client
            .send(peer_on_client, Bytes::from_static(b"ping"))
            .expect("send");

        let event = wait_event(&mut client, &mut server, true, |e| {
            matches!(e, TransportEvent::Receive { .. })
        });
        let TransportEvent::Receive { peer: peer_on_server, frame } = event else {
            unreachable!()
        };
        assert_eq!(frame.as_ref(), b"ping");

        // Both ends registered their peers in the one shared registry.
        assert!(registry.lock().get(peer_on_client).is_some());
        assert!(registry.lock().get(peer_on_server).is_some());
        let client_owner = registry.lock().get(peer_on_client).expect("peer").owner();
        let server_owner = registry.lock().get(peer_on_server).expect("peer").owner();
        assert_ne!(client_owner, server_owner);

        server
            .send(peer_on_server, Bytes::from_static(b"pong"))
            .expect("reply");
        let event = wait_event(&mut server, &mut client, true, |e| {
            matches!(e, TransportEvent::Receive { .. })
        });
        let TransportEvent::Receive { frame, .. } = event else {
            unreachable!()
        };
        assert_eq!(frame.as_ref(), b"pong");

        // Graceful close from the client propagates as a graceful peer
        // close on the server.
        client.close_peer(peer_on_client, true).expect("close");
        let event = wait_event(&mut client, &mut server, true, |e| {
            matches!(e, TransportEvent::PeerClosed { .. })
        });
        let TransportEvent::PeerClosed { graceful, .. } = event else {
            unreachable!()
        };
        assert!(graceful);
    }
}
