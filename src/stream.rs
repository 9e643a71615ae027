// Layered socket stream: raw I/O, throttling, optional TLS, buffering.
// Numan Thabit 2026

use std::{
    collections::VecDeque,
    io,
    mem::MaybeUninit,
    time::Duration,
};

use socket2::Socket;

use crate::{
    error::NetError,
    throttle::{Grant, Throttle},
    tls::{HandshakeStatus, TlsRead, TlsSession},
};

/// Cap on bytes parked in the write-side buffer before `filled` fires.
const WRITE_BUFFER_CAP: usize = 64 * 1024;

/// What one read against the pipeline produced.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Plaintext bytes copied into the caller's buffer.
    pub n: usize,
    /// The underlying transport ran dry; re-arm readable.
    pub would_block: bool,
    /// Orderly end of stream observed under the buffered layer.
    pub closed: bool,
    /// A throttle denied the read; retry after this long.
    pub delay: Option<Duration>,
    /// The unread buffer transitioned from non-empty to empty.
    pub drained: bool,
}

/// What one write against the pipeline produced.
#[derive(Debug, Default)]
pub struct WriteOutcome {
    /// Bytes accepted from the caller (transmitted or parked).
    pub accepted: usize,
    /// The OS would not take more bytes; re-arm writable.
    pub would_block: bool,
    /// A throttle denied the write; retry after this long.
    pub delay: Option<Duration>,
    /// The write buffer transitioned from not-full to full.
    pub filled: bool,
}

/// Raw + throttled layers fused into one `io::Read`/`io::Write` adapter, so
/// the TLS layer above sees plain would-block semantics while every wire
/// byte is charged against the stacked throttles.
struct ThrottledIo<'a> {
    sock: &'a Socket,
    throttle_in: &'a mut Throttle,
    throttle_out: &'a mut Throttle,
    group_in: Option<&'a mut Throttle>,
    group_out: Option<&'a mut Throttle>,
    delay_read: Option<Duration>,
    delay_write: Option<Duration>,
}

fn merge_delay(slot: &mut Option<Duration>, wait: Option<Duration>) {
    if let Some(wait) = wait {
        *slot = Some(match *slot {
            Some(existing) => existing.max(wait),
            None => wait,
        });
    }
}

fn stacked_request(
    own: &mut Throttle,
    group: &mut Option<&mut Throttle>,
    size: usize,
) -> Grant {
    let mut grant = own.request(size);
    if let Some(group) = group.as_deref_mut() {
        let g = group.request(size);
        grant.allowed = grant.allowed.min(g.allowed);
        grant.wait = match (grant.wait, g.wait) {
            (None, w) | (w, None) => w,
            (Some(a), Some(b)) => Some(a.max(b)),
        };
    }
    grant
}

fn stacked_report(own: &mut Throttle, group: &mut Option<&mut Throttle>, size: usize) {
    own.report(size);
    if let Some(group) = group.as_deref_mut() {
        group.report(size);
    }
}

impl io::Read for ThrottledIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let grant = stacked_request(self.throttle_in, &mut self.group_in, buf.len());
        if grant.allowed == 0 {
            merge_delay(&mut self.delay_read, grant.wait);
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "throttled"));
        }
        let n = io::Read::read(&mut &*self.sock, &mut buf[..grant.allowed])?;
        stacked_report(self.throttle_in, &mut self.group_in, n);
        Ok(n)
    }
}

impl io::Write for ThrottledIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let grant = stacked_request(self.throttle_out, &mut self.group_out, buf.len());
        if grant.allowed == 0 {
            merge_delay(&mut self.delay_write, grant.wait);
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "throttled"));
        }
        let n = io::Write::write(&mut &*self.sock, &buf[..grant.allowed])?;
        stacked_report(self.throttle_out, &mut self.group_out, n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The fixed layering wrapped around every connected socket.
///
/// Reads serve the unread buffer first, then pull through TLS (when active)
/// or straight off the throttled raw layer. Writes transmit what the
/// throttle and the OS accept and park the rest, bounded, for
/// [`Pipeline::flush`]. The buffered layer never reports end-of-stream while
/// parked bytes remain.
pub struct Pipeline {
    sock: Socket,
    pub throttle_in: Throttle,
    pub throttle_out: Throttle,
    tls: Option<TlsSession>,
    unread: VecDeque<u8>,
    outbuf: VecDeque<u8>,
    eof_seen: bool,
}

impl Pipeline {
    /// Wraps a connected, non-blocking socket.
    pub fn new(sock: Socket) -> Self {
        Self {
            sock,
            throttle_in: Throttle::new(),
            throttle_out: Throttle::new(),
            tls: None,
            unread: VecDeque::new(),
            outbuf: VecDeque::new(),
            eof_seen: false,
        }
    }

    /// Inserts the TLS layer. Fails with `AlreadyActive` when one exists.
    pub fn start_tls(&mut self, session: TlsSession) -> Result<(), NetError> {
        if self.tls.is_some() {
            return Err(NetError::AlreadyActive);
        }
        self.tls = Some(session);
        Ok(())
    }

    /// Returns the TLS session, if the layer is present.
    pub fn tls(&self) -> Option<&TlsSession> {
        self.tls.as_ref()
    }

    /// Returns true when a TLS layer is present.
    pub fn has_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Access to the raw socket for state-machine bookkeeping.
    pub fn socket(&self) -> &Socket {
        &self.sock
    }

    fn throttled<'a>(
        sock: &'a Socket,
        throttle_in: &'a mut Throttle,
        throttle_out: &'a mut Throttle,
        group_in: Option<&'a mut Throttle>,
        group_out: Option<&'a mut Throttle>,
    ) -> ThrottledIo<'a> {
        ThrottledIo {
            sock,
            throttle_in,
            throttle_out,
            group_in,
            group_out,
            delay_read: None,
            delay_write: None,
        }
    }

    /// Drives the TLS handshake one step.
    pub fn handshake(
        &mut self,
        group_in: Option<&mut Throttle>,
        group_out: Option<&mut Throttle>,
    ) -> Result<HandshakeStatus, NetError> {
        let tls = self.tls.as_mut().ok_or(NetError::NotConnected)?;
        let mut io = Self::throttled(
            &self.sock,
            &mut self.throttle_in,
            &mut self.throttle_out,
            group_in,
            group_out,
        );
        tls.handshake(&mut io)
    }

    /// Reads plaintext into `buf`. A zero-length `buf` returns immediately.
    pub fn read(
        &mut self,
        group_in: Option<&mut Throttle>,
        group_out: Option<&mut Throttle>,
        buf: &mut [u8],
    ) -> Result<ReadOutcome, NetError> {
        let mut outcome = ReadOutcome::default();
        if buf.is_empty() {
            return Ok(outcome);
        }

        let had_unread = !self.unread.is_empty();

        // Buffered layer first: serve unread bytes in order.
        while outcome.n < buf.len() {
            match self.unread.pop_front() {
                Some(byte) => {
                    buf[outcome.n] = byte;
                    outcome.n += 1;
                }
                None => break,
            }
        }
        outcome.drained = had_unread && self.unread.is_empty();

        if outcome.n == buf.len() {
            return Ok(outcome);
        }
        if self.eof_seen {
            outcome.closed = outcome.n == 0;
            return Ok(outcome);
        }

        let mut io = Self::throttled(
            &self.sock,
            &mut self.throttle_in,
            &mut self.throttle_out,
            group_in,
            group_out,
        );
        let rest = &mut buf[outcome.n..];

        match self.tls.as_mut() {
            Some(tls) => match tls.read_plain(&mut io, rest)? {
                TlsRead::Data(n) => outcome.n += n,
                TlsRead::WouldBlock => {
                    outcome.would_block = outcome.n == 0;
                    outcome.delay = io.delay_read;
                }
                TlsRead::Closed => {
                    self.eof_seen = true;
                    outcome.closed = outcome.n == 0;
                }
            },
            None => match io::Read::read(&mut io, rest) {
                Ok(0) => {
                    self.eof_seen = true;
                    outcome.closed = outcome.n == 0;
                }
                Ok(n) => outcome.n += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    outcome.would_block = outcome.n == 0;
                    outcome.delay = io.delay_read;
                }
                Err(err) => return Err(NetError::Io(err)),
            },
        }

        Ok(outcome)
    }

    /// Pushes bytes back so the next read returns them first, in order.
    pub fn unread(&mut self, data: &[u8]) {
        for &byte in data.iter().rev() {
            self.unread.push_front(byte);
        }
    }

    /// Returns true while the buffered layer holds unconsumed input.
    pub fn has_buffered_input(&self) -> bool {
        !self.unread.is_empty()
    }

    /// Returns true while parked output remains to be flushed.
    pub fn has_pending_output(&self) -> bool {
        !self.outbuf.is_empty()
    }

    /// Writes `data`. Empty writes are no-ops.
    pub fn write(
        &mut self,
        mut group_in: Option<&mut Throttle>,
        mut group_out: Option<&mut Throttle>,
        data: &[u8],
    ) -> Result<WriteOutcome, NetError> {
        let mut outcome = self.flush(group_in.as_deref_mut(), group_out.as_deref_mut())?;
        if data.is_empty() {
            return Ok(outcome);
        }
        outcome.filled = false;

        let mut offset = 0;

        // While nothing is parked, bytes may go straight down the stack.
        if self.outbuf.is_empty() && !outcome.would_block && outcome.delay.is_none() {
            match self.transmit(group_in, group_out, data) {
                Ok(step) => {
                    offset = step.sent;
                    outcome.would_block = step.would_block;
                    merge_delay(&mut outcome.delay, step.delay);
                }
                Err(err) => return Err(err),
            }
        }

        // Park the remainder, bounded.
        let was_full = self.outbuf.len() >= WRITE_BUFFER_CAP;
        while offset < data.len() && self.outbuf.len() < WRITE_BUFFER_CAP {
            self.outbuf.push_back(data[offset]);
            offset += 1;
        }
        let is_full = self.outbuf.len() >= WRITE_BUFFER_CAP;
        outcome.filled = !was_full && is_full;
        outcome.accepted = offset;
        Ok(outcome)
    }

    /// Pushes parked output down the stack.
    pub fn flush(
        &mut self,
        group_in: Option<&mut Throttle>,
        group_out: Option<&mut Throttle>,
    ) -> Result<WriteOutcome, NetError> {
        let mut outcome = WriteOutcome::default();
        if self.outbuf.is_empty() {
            // Still give TLS a chance to push buffered records out.
            if let Some(tls) = self.tls.as_mut() {
                let mut io = Self::throttled(
                    &self.sock,
                    &mut self.throttle_in,
                    &mut self.throttle_out,
                    group_in,
                    group_out,
                );
                let done = tls.flush_records(&mut io)?;
                outcome.would_block = !done && io.delay_write.is_none();
                outcome.delay = io.delay_write;
            }
            return Ok(outcome);
        }

        let pending: Vec<u8> = self.outbuf.iter().copied().collect();
        let step = self.transmit(group_in, group_out, &pending)?;
        self.outbuf.drain(..step.sent);
        outcome.would_block = step.would_block;
        outcome.delay = step.delay;
        Ok(outcome)
    }

    fn transmit(
        &mut self,
        group_in: Option<&mut Throttle>,
        group_out: Option<&mut Throttle>,
        data: &[u8],
    ) -> Result<TransmitStep, NetError> {
        let mut io = Self::throttled(
            &self.sock,
            &mut self.throttle_in,
            &mut self.throttle_out,
            group_in,
            group_out,
        );
        let mut step = TransmitStep::default();

        match self.tls.as_mut() {
            Some(tls) => {
                match tls.write_plain(&mut io, data) {
                    Ok(n) => step.sent = n,
                    Err(NetError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => {
                        step.would_block = io.delay_write.is_none();
                    }
                    Err(err) => return Err(err),
                }
                step.delay = io.delay_write;
            }
            None => {
                let mut sent = 0;
                while sent < data.len() {
                    match io::Write::write(&mut io, &data[sent..]) {
                        Ok(0) => break,
                        Ok(n) => sent += n,
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            step.would_block = io.delay_write.is_none();
                            break;
                        }
                        Err(err) => return Err(NetError::Io(err)),
                    }
                }
                step.sent = sent;
                step.delay = io.delay_write;
            }
        }

        Ok(step)
    }

    /// One-byte `MSG_PEEK` used to confirm a hang-up notification: returns
    /// true when the peer really finished writing (peek sees end of stream).
    pub fn peek_eof(&mut self) -> Result<bool, NetError> {
        if self.has_buffered_input() {
            return Ok(false);
        }
        let mut probe = [MaybeUninit::<u8>::uninit(); 1];
        match self.sock.peek(&mut probe) {
            Ok(0) => Ok(true),
            Ok(_) => Ok(false),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(NetError::Io(err)),
        }
    }

    /// Sends the TLS close alert (both directions).
    pub fn tls_bye(&mut self) -> Result<(), NetError> {
        if let Some(tls) = self.tls.as_mut() {
            let mut io = Self::throttled(
                &self.sock,
                &mut self.throttle_in,
                &mut self.throttle_out,
                None,
                None,
            );
            tls.close(&mut io)?;
        }
        Ok(())
    }

    /// Closes the TLS write direction before shutting down the socket's.
    pub fn tls_shutdown_write(&mut self) -> Result<(), NetError> {
        if let Some(tls) = self.tls.as_mut() {
            let mut io = Self::throttled(
                &self.sock,
                &mut self.throttle_in,
                &mut self.throttle_out,
                None,
                None,
            );
            tls.shutdown_write(&mut io)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TransmitStep {
    sent: usize,
    would_block: bool,
    delay: Option<Duration>,
}
