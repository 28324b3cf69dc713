use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{KilnResult, SocketError};
use crate::syscalls;

use super::buffer::SocketBuffer;
use super::poller::PollerCtl;
use super::selector_pool::{BlockOp, SelectorPool};
use super::tls::TlsSession;
use super::EndpointShared;

/// Keep-alive disposition once a sendfile transfer completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendfileKeepAlive {
    /// Close the connection.
    None,
    /// Re-register READ and wait for the next request.
    Open,
    /// The next request is already buffered; process it immediately.
    Pipelined,
}

/// In-flight zero-copy file transfer attached to a connection.
pub struct SendfileData {
    pub path: String,
    pub file: Option<File>,
    pub pos: u64,
    pub remaining: u64,
    pub keep_alive: SendfileKeepAlive,
}

impl SendfileData {
    pub fn new(path: String, pos: u64, length: u64, keep_alive: SendfileKeepAlive) -> Self {
        Self {
            path,
            file: None,
            pos,
            remaining: length,
            keep_alive,
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection state: the raw socket, its buffers, interest ops,
/// timeout bookkeeping, optional TLS engine and sendfile state. Reset
/// between keep-alive requests, closed exactly once.
pub struct SocketWrapper {
    fd: i32,
    /// Process-unique connection identity; fd values are reused by the
    /// OS, this never is.
    id: u64,
    shared: Arc<EndpointShared>,
    poller: Arc<PollerCtl>,
    selector_pool: Arc<SelectorPool>,

    pub read_buffer: Mutex<SocketBuffer>,
    pub write_buffer: Mutex<SocketBuffer>,
    tls: Option<Mutex<TlsSession>>,

    interest_ops: AtomicI32,
    read_timeout_ms: AtomicU64,
    write_timeout_ms: AtomicU64,
    last_read: AtomicU64,
    last_write: AtomicU64,
    keep_alive_left: AtomicI32,

    error: Mutex<Option<SocketError>>,
    sendfile: Mutex<Option<SendfileData>>,
    closed: AtomicBool,
    // Serializes socket-processor runs for this connection.
    processing: Mutex<()>,
}

impl SocketWrapper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fd: i32,
        shared: Arc<EndpointShared>,
        poller: Arc<PollerCtl>,
        selector_pool: Arc<SelectorPool>,
        read_buffer: SocketBuffer,
        write_buffer: SocketBuffer,
        tls: Option<TlsSession>,
    ) -> Self {
        let now = shared.now_ms();
        Self {
            fd,
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            shared,
            poller,
            selector_pool,
            read_buffer: Mutex::new(read_buffer),
            write_buffer: Mutex::new(write_buffer),
            tls: tls.map(Mutex::new),
            interest_ops: AtomicI32::new(0),
            read_timeout_ms: AtomicU64::new(0),
            write_timeout_ms: AtomicU64::new(0),
            last_read: AtomicU64::new(now),
            last_write: AtomicU64::new(now),
            keep_alive_left: AtomicI32::new(-1),
            error: Mutex::new(None),
            sendfile: Mutex::new(None),
            closed: AtomicBool::new(false),
            processing: Mutex::new(()),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Arc<EndpointShared> {
        &self.shared
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    pub fn lock_processing(&self) -> MutexGuard<'_, ()> {
        self.processing.lock().unwrap()
    }

    // ---- Interest ops (mirrors the poller's selection key) ----

    pub fn interest_ops(&self) -> i32 {
        self.interest_ops.load(Ordering::Acquire)
    }

    pub fn set_interest_ops(&self, ops: i32) {
        self.interest_ops.store(ops, Ordering::Release);
    }

    /// Ask the poller to re-arm READ once the current pass returns.
    pub fn register_read_interest(self: &Arc<Self>) {
        trace!(fd = self.fd, "registering read interest");
        self.poller.add(self.clone(), super::poller::OP_READ);
    }

    pub fn register_write_interest(self: &Arc<Self>) {
        trace!(fd = self.fd, "registering write interest");
        self.poller.add(self.clone(), super::poller::OP_WRITE);
    }

    // ---- Timeouts and activity stamps ----

    pub fn set_read_timeout(&self, timeout: Duration) {
        self.read_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn read_timeout_ms(&self) -> u64 {
        self.read_timeout_ms.load(Ordering::Acquire)
    }

    pub fn set_write_timeout(&self, timeout: Duration) {
        self.write_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn write_timeout_ms(&self) -> u64 {
        self.write_timeout_ms.load(Ordering::Acquire)
    }

    pub fn update_last_read(&self) {
        self.last_read.store(self.shared.now_ms(), Ordering::Release);
    }

    pub fn update_last_write(&self) {
        self.last_write.store(self.shared.now_ms(), Ordering::Release);
    }

    pub fn last_read(&self) -> u64 {
        self.last_read.load(Ordering::Acquire)
    }

    pub fn last_write(&self) -> u64 {
        self.last_write.load(Ordering::Acquire)
    }

    // ---- Keep-alive budget ----

    pub fn set_keep_alive_left(&self, count: i32) {
        self.keep_alive_left.store(count, Ordering::Release);
    }

    pub fn keep_alive_left(&self) -> i32 {
        self.keep_alive_left.load(Ordering::Acquire)
    }

    /// Consume one request from the budget; returns the remainder
    /// (negative means unlimited).
    pub fn decrement_keep_alive(&self) -> i32 {
        let left = self.keep_alive_left.load(Ordering::Acquire);
        if left < 0 {
            return left;
        }
        self.keep_alive_left.fetch_sub(1, Ordering::AcqRel) - 1
    }

    // ---- Error slot ----

    /// Record the first error; later errors are ignored.
    pub fn set_error(&self, error: SocketError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn error(&self) -> Option<SocketError> {
        *self.error.lock().unwrap()
    }

    // ---- Sendfile ----

    pub fn set_sendfile_data(&self, data: Option<SendfileData>) {
        *self.sendfile.lock().unwrap() = data;
    }

    pub fn has_sendfile_data(&self) -> bool {
        self.sendfile.lock().unwrap().is_some()
    }

    pub fn sendfile_slot(&self) -> MutexGuard<'_, Option<SendfileData>> {
        self.sendfile.lock().unwrap()
    }

    // ---- TLS ----

    pub fn handshake_complete(&self) -> bool {
        match &self.tls {
            None => true,
            Some(tls) => tls.lock().unwrap().is_handshake_complete(),
        }
    }

    pub fn drive_handshake(&self) -> super::tls::HandshakeStatus {
        match &self.tls {
            None => super::tls::HandshakeStatus::Complete,
            Some(tls) => tls.lock().unwrap().drive_handshake(self.fd),
        }
    }

    // ---- I/O ----

    /// Read available bytes into `dst`.
    ///
    /// Returns n > 0 for data, 0 when nothing is available (non-blocking),
    /// and -1 at end of stream. Blocking mode parks on the selector pool up
    /// to the read timeout.
    pub fn read(&self, block: bool, dst: &mut [u8]) -> KilnResult<isize> {
        if let Some(err) = self.error() {
            return Err(err.as_io().into());
        }
        let deadline = self.deadline(block, self.read_timeout_ms());
        loop {
            let outcome = match &self.tls {
                None => syscalls::read_nonblocking(self.fd, dst)?,
                Some(tls) => tls.lock().unwrap().read_plain(self.fd, dst)?,
            };
            match outcome {
                Some(0) => return Ok(-1),
                Some(n) => {
                    self.update_last_read();
                    return Ok(n as isize);
                }
                None => {
                    if !block {
                        return Ok(0);
                    }
                    if !self.await_ready(BlockOp::Read, deadline)? {
                        self.set_error(SocketError::Timeout);
                        return Err(SocketError::Timeout.as_io().into());
                    }
                }
            }
        }
    }

    /// Write `src` fully in blocking mode, or as much as the socket takes
    /// otherwise. Returns bytes consumed.
    pub fn write(&self, block: bool, src: &[u8]) -> KilnResult<usize> {
        if let Some(err) = self.error() {
            return Err(err.as_io().into());
        }
        match &self.tls {
            None => self.write_raw(block, src),
            Some(_) => self.write_tls(block, src),
        }
    }

    fn write_raw(&self, block: bool, src: &[u8]) -> KilnResult<usize> {
        let deadline = self.deadline(block, self.write_timeout_ms());
        let mut written = 0;
        while written < src.len() {
            match syscalls::write_nonblocking(self.fd, &src[written..])? {
                Some(n) => {
                    written += n;
                    self.update_last_write();
                }
                None => {
                    if !block {
                        break;
                    }
                    if !self.await_ready(BlockOp::Write, deadline)? {
                        self.set_error(SocketError::Timeout);
                        return Err(SocketError::Timeout.as_io().into());
                    }
                }
            }
        }
        Ok(written)
    }

    fn write_tls(&self, block: bool, src: &[u8]) -> KilnResult<usize> {
        let deadline = self.deadline(block, self.write_timeout_ms());
        let tls = self.tls.as_ref().unwrap();
        let mut session = tls.lock().unwrap();
        let written = session.write_plain(src)?;
        loop {
            if session.flush_tls(self.fd)? {
                self.update_last_write();
                return Ok(written);
            }
            if !block {
                return Ok(written);
            }
            if !self.await_ready(BlockOp::Write, deadline)? {
                self.set_error(SocketError::Timeout);
                return Err(SocketError::Timeout.as_io().into());
            }
        }
    }

    fn deadline(&self, block: bool, timeout_ms: u64) -> Option<Instant> {
        if block && timeout_ms > 0 {
            Some(Instant::now() + Duration::from_millis(timeout_ms))
        } else {
            None
        }
    }

    fn await_ready(&self, op: BlockOp, deadline: Option<Instant>) -> KilnResult<bool> {
        let timeout = match deadline {
            None => None,
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Ok(false);
                }
                Some(d - now)
            }
        };
        self.selector_pool.wait_ready(self.fd, op, timeout)
    }

    // ---- Close ----

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close exactly once: deregister from the connection map, release the
    /// connection permit, detach the protocol, recycle buffers, close the
    /// fd. The map entry goes first so nothing can observe a live entry
    /// for a closing socket; the fd closes before buffer recycling so a
    /// worker blocked on this socket gets woken instead of waited on.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(fd = self.fd, id = self.id, "closing connection");

        self.shared.connections.lock().unwrap().remove(&self.fd);
        self.shared.count_down_connection();
        self.shared.metrics.dec_conn();

        // Drop any in-flight file transfer.
        self.sendfile.lock().unwrap().take();

        if let Some(tls) = &self.tls {
            // try_lock: a blocked worker may hold the session; skipping
            // the close_notify is preferable to waiting for it.
            if let Ok(mut session) = tls.try_lock() {
                session.send_close_notify(self.fd);
            }
        }
        syscalls::close_fd(self.fd);

        if let Some(handler) = self.shared.protocol_handler() {
            handler.release(self);
        }

        if self.shared.is_running() && !self.shared.is_paused() {
            if let Some(cache) = &self.shared.buffer_cache {
                // try_lock: a worker may still hold a buffer while it
                // unwinds from the closed fd; the buffers are then simply
                // not recycled.
                if let (Ok(mut read), Ok(mut write)) =
                    (self.read_buffer.try_lock(), self.write_buffer.try_lock())
                {
                    let read = std::mem::replace(&mut *read, SocketBuffer::with_capacity(0));
                    let write = std::mem::replace(&mut *write, SocketBuffer::with_capacity(0));
                    cache.push(super::BufferPair::recycled(read, write));
                }
            }
        }
    }
}

impl Drop for SocketWrapper {
    fn drop(&mut self) {
        // Wrappers are normally closed explicitly; this is the backstop for
        // error paths that lost the wrapper before registration.
        if !self.closed.load(Ordering::Acquire) {
            self.close();
        }
    }
}
