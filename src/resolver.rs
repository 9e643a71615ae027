// Asynchronous, cancellable name resolution.
// Numan Thabit 2026

use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
};

use ahash::AHashMap;
use tracing::debug;

use crate::error::NetError;

/// Address family constraint a socket imposes on resolution results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Family {
    /// Accept any candidate.
    #[default]
    Any,
    /// IPv4 only.
    Ipv4,
    /// IPv6 only.
    Ipv6,
    /// Filesystem (unix-domain) addresses only.
    Local,
}

/// A resolved candidate address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NbAddr {
    /// An internet address with port.
    Inet(SocketAddr),
    /// A filesystem path for local sockets.
    Local(PathBuf),
}

impl NbAddr {
    /// Returns true when the candidate satisfies the family constraint.
    pub fn matches(&self, family: Family) -> bool {
        match (self, family) {
            (_, Family::Any) => true,
            (NbAddr::Inet(addr), Family::Ipv4) => addr.is_ipv4(),
            (NbAddr::Inet(addr), Family::Ipv6) => addr.is_ipv6(),
            (NbAddr::Local(_), Family::Local) => true,
            _ => false,
        }
    }
}

/// Identifier of one in-flight resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolveId(pub u64);

/// Cancellation token for one request.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests cancellation. The completion is delivered exactly once, as
    /// `Cancelled`, and the real result (if it arrives later) is dropped.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns true once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A finished resolution handed back to the loop.
#[derive(Debug)]
pub struct ResolveReply {
    pub id: ResolveId,
    pub result: Result<Vec<NbAddr>, NetError>,
}

struct Pending {
    token: CancelToken,
}

/// Resolves textual addresses off-thread and surfaces ordered candidate
/// lists through [`Resolver::poll`].
///
/// Accepted forms: `"host:port"`, a literal `"ip:port"`, or an absolute
/// filesystem path for local sockets. Literal and local addresses complete
/// without touching the worker, but their replies still arrive through the
/// queue so callers observe one completion discipline.
pub struct Resolver {
    tx: Sender<ResolveReply>,
    rx: Receiver<ResolveReply>,
    pending: AHashMap<ResolveId, Pending>,
    next_id: u64,
}

impl Resolver {
    /// Creates an idle resolver.
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self {
            tx,
            rx,
            pending: AHashMap::new(),
            next_id: 1,
        }
    }

    fn allocate(&mut self) -> (ResolveId, CancelToken) {
        let id = ResolveId(self.next_id);
        self.next_id += 1;
        let token = CancelToken::new();
        self.pending.insert(
            id,
            Pending {
                token: token.clone(),
            },
        );
        (id, token)
    }

    /// Starts resolving `address`. The reply surfaces from [`Resolver::poll`].
    pub fn resolve(&mut self, address: &str) -> (ResolveId, CancelToken) {
        let (id, token) = self.allocate();

        if address.starts_with('/') {
            let reply = ResolveReply {
                id,
                result: Ok(vec![NbAddr::Local(PathBuf::from(address))]),
            };
            let _ = self.tx.send(reply);
            return (id, token);
        }

        if let Ok(addr) = address.parse::<SocketAddr>() {
            let reply = ResolveReply {
                id,
                result: Ok(vec![NbAddr::Inet(addr)]),
            };
            let _ = self.tx.send(reply);
            return (id, token);
        }

        let tx = self.tx.clone();
        let owned = address.to_string();
        let worker_token = token.clone();
        std::thread::Builder::new()
            .name("numibus-resolve".into())
            .spawn(move || {
                let result = match owned.to_socket_addrs() {
                    Ok(addrs) => {
                        let candidates: Vec<NbAddr> = addrs.map(NbAddr::Inet).collect();
                        if candidates.is_empty() {
                            Err(NetError::ResolveFailure(owned.clone()))
                        } else {
                            Ok(candidates)
                        }
                    }
                    Err(err) => {
                        debug!(address = %owned, ?err, "resolution failed");
                        Err(NetError::ResolveFailure(owned.clone()))
                    }
                };
                if worker_token.is_cancelled() {
                    return;
                }
                let _ = tx.send(ResolveReply { id, result });
            })
            .expect("spawn resolver thread");

        (id, token)
    }

    /// Drains finished resolutions, honouring cancellation: a cancelled
    /// request yields exactly one `Cancelled` reply, never its real result.
    pub fn poll(&mut self) -> Vec<ResolveReply> {
        let mut replies = Vec::new();

        // Emit Cancelled for requests whose token flipped since last poll.
        let cancelled: Vec<ResolveId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.token.is_cancelled())
            .map(|(&id, _)| id)
            .collect();
        for id in cancelled {
            self.pending.remove(&id);
            replies.push(ResolveReply {
                id,
                result: Err(NetError::Cancelled),
            });
        }

        while let Ok(reply) = self.rx.try_recv() {
            match self.pending.remove(&reply.id) {
                Some(pending) if pending.token.is_cancelled() => {
                    replies.push(ResolveReply {
                        id: reply.id,
                        result: Err(NetError::Cancelled),
                    });
                }
                Some(_) => replies.push(reply),
                // Already completed as Cancelled; drop the late result.
                None => {}
            }
        }

        replies
    }

    /// Number of requests still in flight.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
