// Edge-triggered readiness engine on top of epoll.
// Numan Thabit 2026

use std::{
    os::fd::AsFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::SyncSender,
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use ahash::AHashSet;
use nix::sys::{
    epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout},
    eventfd::{EfdFlags, EventFd},
};
use tracing::warn;

use crate::error::NetError;

/// Token reserved for the internal wake-up descriptor.
const WAKE_TOKEN: u64 = u64::MAX;

const EVENT_BATCH: usize = 64;

/// Readiness directions a socket can be watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    /// Watch for inbound readiness only.
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    /// Watch for outbound readiness only.
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    /// Watch both directions.
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    fn as_flags(self) -> EpollFlags {
        // Edge-triggered everywhere; RDHUP distinguishes a half-close from
        // ordinary readability.
        let mut flags = EpollFlags::EPOLLET | EpollFlags::EPOLLRDHUP;
        if self.readable {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.writable {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

/// Condition bits observed for one socket in one wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    /// Merges another observation into this one (event coalescing).
    pub fn merge(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.hangup |= other.hangup;
        self.error |= other.error;
    }

    /// Returns true when no bit is set.
    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable && !self.hangup && !self.error
    }

    fn from_flags(flags: EpollFlags) -> Self {
        Readiness {
            readable: flags.contains(EpollFlags::EPOLLIN),
            writable: flags.contains(EpollFlags::EPOLLOUT),
            hangup: flags.contains(EpollFlags::EPOLLHUP)
                || flags.contains(EpollFlags::EPOLLRDHUP),
            error: flags.contains(EpollFlags::EPOLLERR),
        }
    }
}

/// One readiness observation handed from the reactor to the scheduler side.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub token: u64,
    pub readiness: Readiness,
}

/// The process-wide readiness engine.
///
/// Watches registered descriptors edge-triggered and surfaces observations
/// either inline through [`Reactor::poll_into`] or, when
/// [`Reactor::start_thread`] is used, through a bounded channel drained by
/// the owning loop. Registration is tracked per token so that double `add`
/// fails with `AlreadyActive` and `remove` after close stays idempotent.
pub struct Reactor {
    epoll: Epoll,
    wake: EventFd,
    registered: Mutex<AHashSet<u64>>,
    stop: AtomicBool,
}

impl Reactor {
    /// Creates the epoll instance and its wake-up descriptor.
    pub fn new() -> Result<Self, NetError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|err| NetError::Io(err.into()))?;
        let wake = EventFd::from_flags(EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map_err(|err| NetError::Io(err.into()))?;
        epoll
            .add(
                wake.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN),
            )
            .map_err(|err| NetError::Io(err.into()))?;
        Ok(Self {
            epoll,
            wake,
            registered: Mutex::new(AHashSet::new()),
            stop: AtomicBool::new(false),
        })
    }

    /// Starts watching `fd` under `token`.
    pub fn add<F: AsFd>(&self, fd: F, token: u64, interest: Interest) -> Result<(), NetError> {
        let mut registered = self.registered.lock().expect("reactor registry");
        if registered.contains(&token) {
            return Err(NetError::AlreadyActive);
        }
        self.epoll
            .add(fd, EpollEvent::new(interest.as_flags(), token))
            .map_err(|err| NetError::Io(err.into()))?;
        registered.insert(token);
        Ok(())
    }

    /// Replaces the watched interest set of an already-registered descriptor.
    pub fn modify<F: AsFd>(&self, fd: F, token: u64, interest: Interest) -> Result<(), NetError> {
        let registered = self.registered.lock().expect("reactor registry");
        if !registered.contains(&token) {
            return Err(NetError::NotConnected);
        }
        let mut event = EpollEvent::new(interest.as_flags(), token);
        self.epoll
            .modify(fd, &mut event)
            .map_err(|err| NetError::Io(err.into()))?;
        Ok(())
    }

    /// Stops watching a descriptor. Safe to call after the handle was closed.
    pub fn remove<F: AsFd>(&self, fd: F, token: u64) {
        let mut registered = self.registered.lock().expect("reactor registry");
        if !registered.remove(&token) {
            return;
        }
        // The kernel drops closed fds from the set on its own; an ENOENT or
        // EBADF here is the idempotent case, not a failure.
        if let Err(err) = self.epoll.delete(fd) {
            if err != nix::errno::Errno::ENOENT && err != nix::errno::Errno::EBADF {
                warn!(token, ?err, "epoll delete failed");
            }
        }
    }

    /// Returns true when `token` is currently registered.
    pub fn is_watched(&self, token: u64) -> bool {
        self.registered
            .lock()
            .expect("reactor registry")
            .contains(&token)
    }

    /// Drains all currently ready events into `out`, waiting up to `timeout`
    /// (forever when `None`).
    pub fn poll_into(
        &self,
        out: &mut Vec<ReadyEvent>,
        timeout: Option<Duration>,
    ) -> Result<(), NetError> {
        let mut events = [EpollEvent::empty(); EVENT_BATCH];
        let n = match self.epoll.wait(&mut events, epoll_timeout(timeout)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(err) => return Err(NetError::Io(err.into())),
        };
        for event in events.iter().take(n) {
            let token = event.data();
            if token == WAKE_TOKEN {
                self.drain_wake();
                continue;
            }
            out.push(ReadyEvent {
                token,
                readiness: Readiness::from_flags(event.events()),
            });
        }
        Ok(())
    }

    /// Spawns the dedicated poll thread, forwarding observations over `tx`.
    pub fn start_thread(self: &Arc<Self>, tx: SyncSender<ReadyEvent>) -> JoinHandle<()> {
        let reactor = Arc::clone(self);
        std::thread::Builder::new()
            .name("numibus-reactor".into())
            .spawn(move || {
                let mut batch = Vec::with_capacity(EVENT_BATCH);
                while !reactor.stop.load(Ordering::Acquire) {
                    batch.clear();
                    if let Err(err) =
                        reactor.poll_into(&mut batch, Some(Duration::from_millis(200)))
                    {
                        warn!(?err, "reactor poll failed");
                        break;
                    }
                    for event in batch.drain(..) {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                }
            })
            .expect("spawn reactor thread")
    }

    /// Signals the poll thread to exit and unblocks a pending wait.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake_up();
    }

    /// Forces a blocked `poll_into` to return early.
    pub fn wake_up(&self) {
        let _ = self.wake.arm();
    }

    fn drain_wake(&self) {
        let _ = self.wake.read();
    }
}

fn epoll_timeout(timeout: Option<Duration>) -> EpollTimeout {
    match timeout {
        None => EpollTimeout::NONE,
        Some(duration) => {
            let ms = duration.as_millis().min(u16::MAX as u128) as u16;
            EpollTimeout::from(ms)
        }
    }
}
