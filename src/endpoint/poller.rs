use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, trace, warn};

use crate::error::{KilnResult, SocketError};
use crate::syscalls::{self, Epoll};

use super::pools::SyncStack;
use super::socket::{SendfileKeepAlive, SocketWrapper};
use super::worker::{Dispatcher, SocketEvent};
use super::EndpointShared;

/// Interest ops. READ and WRITE match the selector's native values;
/// REGISTER is a pseudo-op consumed by the event drain.
pub const OP_READ: i32 = syscalls::EPOLLIN as i32;
pub const OP_WRITE: i32 = syscalls::EPOLLOUT as i32;
pub const OP_REGISTER: i32 = 0x100;

/// Pooled (channel, interestOps) value object. Ownership moves into the
/// events queue and back to the cache after application.
pub struct PollerEvent {
    wrapper: Option<Arc<SocketWrapper>>,
    interest_ops: i32,
}

impl PollerEvent {
    fn new(wrapper: Arc<SocketWrapper>, interest_ops: i32) -> Self {
        Self {
            wrapper: Some(wrapper),
            interest_ops,
        }
    }

    fn reset(&mut self, wrapper: Arc<SocketWrapper>, interest_ops: i32) {
        self.wrapper = Some(wrapper);
        self.interest_ops = interest_ops;
    }

    fn clear(&mut self) {
        self.wrapper = None;
        self.interest_ops = 0;
    }
}

/// Producer side of the poller, shared with the acceptor and workers.
/// Wake-up protocol: producers increment the counter after enqueueing; a
/// prior value of -1 means the poller is blocked in select and must be
/// woken through the pipe. The consumer swaps in -1 before selecting; a
/// positive prior value short-circuits to a non-blocking select.
pub struct PollerCtl {
    events: Mutex<VecDeque<PollerEvent>>,
    wakeup_counter: AtomicI64,
    wake_tx: i32,
    event_cache: Option<SyncStack<PollerEvent>>,
    close: AtomicBool,
}

impl PollerCtl {
    pub fn new(wake_tx: i32, event_cache_size: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            wakeup_counter: AtomicI64::new(0),
            wake_tx,
            event_cache: if event_cache_size > 0 {
                Some(SyncStack::new(event_cache_size))
            } else {
                None
            },
            close: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close.load(Ordering::Acquire)
    }

    /// Mark the poller for shutdown and wake it.
    pub fn shutdown(&self) {
        self.close.store(true, Ordering::Release);
        syscalls::wake_pipe(self.wake_tx);
    }

    /// Queue an interest-op change for an already-registered channel.
    pub fn add(&self, wrapper: Arc<SocketWrapper>, interest_ops: i32) {
        let event = self.take_event(wrapper, interest_ops);
        self.add_event(event);
    }

    /// First registration of a newly accepted channel: READ interest via
    /// the REGISTER pseudo-op.
    pub fn register(&self, wrapper: Arc<SocketWrapper>) {
        wrapper.set_interest_ops(OP_READ);
        let event = self.take_event(wrapper, OP_REGISTER);
        self.add_event(event);
    }

    fn take_event(&self, wrapper: Arc<SocketWrapper>, interest_ops: i32) -> PollerEvent {
        if let Some(cache) = &self.event_cache {
            if let Some(mut event) = cache.pop() {
                event.reset(wrapper, interest_ops);
                return event;
            }
        }
        PollerEvent::new(wrapper, interest_ops)
    }

    fn add_event(&self, event: PollerEvent) {
        self.events.lock().unwrap().push_back(event);
        if self.wakeup_counter.fetch_add(1, Ordering::AcqRel) == -1 {
            syscalls::wake_pipe(self.wake_tx);
        }
    }

    fn return_event(&self, mut event: PollerEvent, recycle: bool) {
        event.clear();
        if recycle {
            if let Some(cache) = &self.event_cache {
                cache.push(event);
            }
        }
    }
}

/// Result of a sendfile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendfileState {
    Pending,
    Done,
    Error,
}

/// The poller's private view of one registration. Only the poller thread
/// creates, mutates or removes entries, which makes the single-mutator
/// invariant structural.
struct SelectionKey {
    wrapper: Arc<SocketWrapper>,
    interest_ops: i32,
}

/// Single thread owning the main readiness selector. Consumes
/// registration events, drives select, dispatches ready sockets to the
/// worker pool and sweeps for timeouts.
pub struct Poller {
    ctl: Arc<PollerCtl>,
    shared: Arc<EndpointShared>,
    dispatcher: Arc<Dispatcher>,
    epoll: Epoll,
    keys: HashMap<i32, SelectionKey>,
    wake_rx: i32,
    selector_timeout_ms: u64,
    timeout_interval_ms: u64,
    next_expiration: u64,
}

impl Poller {
    pub fn new(
        ctl: Arc<PollerCtl>,
        shared: Arc<EndpointShared>,
        dispatcher: Arc<Dispatcher>,
        wake_rx: i32,
    ) -> KilnResult<Self> {
        let epoll = Epoll::new()?;
        // The wake pipe is a permanent READ registration keyed by its fd.
        epoll.add(wake_rx, wake_rx as u64, OP_READ)?;
        let selector_timeout_ms = shared.config.selector_timeout_ms;
        let timeout_interval_ms = shared.config.timeout_interval_ms;
        Ok(Self {
            ctl,
            shared,
            dispatcher,
            epoll,
            keys: HashMap::new(),
            wake_rx,
            selector_timeout_ms,
            timeout_interval_ms,
            next_expiration: 0,
        })
    }

    /// Main loop; runs on the dedicated poller thread until shutdown.
    pub fn run(mut self) {
        let mut ready = vec![syscalls::epoll_event { events: 0, u64: 0 }; 1024];
        loop {
            let mut has_events = false;
            let mut key_count = 0;

            if !self.ctl.is_closed() {
                has_events = self.events();
                let result = if self.ctl.wakeup_counter.swap(-1, Ordering::AcqRel) > 0 {
                    // Pending work: non-blocking select.
                    self.epoll.wait(&mut ready, 0)
                } else {
                    self.epoll.wait(&mut ready, self.selector_timeout_ms as i32)
                };
                self.ctl.wakeup_counter.store(0, Ordering::Release);
                match result {
                    Ok(n) => key_count = n,
                    Err(e) => {
                        error!(error = %e, "selector loop error");
                        continue;
                    }
                }
            }

            if self.ctl.is_closed() {
                self.events();
                self.timeout(0, false);
                break;
            }

            if key_count == 0 {
                has_events |= self.events();
            }

            let mut dispatched = 0;
            for i in 0..key_count {
                let token = ready[i].u64;
                let ready_ops = ready[i].events as i32;
                if token == self.wake_rx as u64 {
                    syscalls::drain_pipe(self.wake_rx);
                    continue;
                }
                dispatched += 1;
                self.process_key(token as i32, ready_ops);
            }

            self.timeout(dispatched, has_events);
        }

        // Shutdown: every remaining registration is cancelled before the
        // selector closes.
        let fds: Vec<i32> = self.keys.keys().copied().collect();
        for fd in fds {
            self.cancel_key(fd);
        }
        self.shared.stop_latch().count_down();
        debug!("poller exiting");
    }

    /// Drain the events queue. Returns true if any event was applied.
    fn events(&mut self) -> bool {
        let mut result = false;
        loop {
            let event = self.ctl.events.lock().unwrap().pop_front();
            let Some(event) = event else { break };
            result = true;
            let recycle = self.shared.is_running() && !self.shared.is_paused();

            let Some(wrapper) = event.wrapper.clone() else {
                self.ctl.return_event(event, recycle);
                continue;
            };
            let fd = wrapper.fd();
            let interest_ops = event.interest_ops;
            self.ctl.return_event(event, recycle);

            if interest_ops == OP_REGISTER {
                if wrapper.is_closed() {
                    continue;
                }
                match self.epoll.add(fd, fd as u64, OP_READ) {
                    Ok(()) => {
                        self.keys.insert(
                            fd,
                            SelectionKey {
                                wrapper,
                                interest_ops: OP_READ,
                            },
                        );
                    }
                    Err(e) => {
                        error!(fd, error = %e, "channel registration failed");
                        wrapper.close();
                    }
                }
            } else {
                let current = self
                    .keys
                    .get(&fd)
                    .map(|key| (key.wrapper.clone(), key.interest_ops));
                match current {
                    None => {
                        // The key was cancelled while the event was queued;
                        // release the connection here.
                        wrapper.close();
                    }
                    Some((registered, ops)) => {
                        if registered.is_closed() {
                            self.cancel_key(fd);
                            continue;
                        }
                        let ops = ops | interest_ops;
                        if let Some(key) = self.keys.get_mut(&fd) {
                            key.interest_ops = ops;
                        }
                        registered.set_interest_ops(ops);
                        if let Err(e) = self.epoll.modify(fd, fd as u64, ops) {
                            debug!(fd, error = %e, "interest update failed, cancelling");
                            self.cancel_key(fd);
                        }
                    }
                }
            }
        }
        result
    }

    /// Route one ready key: sendfile continues inline on the poller;
    /// everything else has its ready ops cleared from interest and is
    /// handed to the worker pool.
    fn process_key(&mut self, fd: i32, ready_ops: i32) {
        let Some(key) = self.keys.get(&fd) else {
            return;
        };
        let wrapper = key.wrapper.clone();

        if self.ctl.is_closed() || wrapper.is_closed() {
            self.cancel_key(fd);
            return;
        }

        if ready_ops & (OP_READ | OP_WRITE) == 0 {
            // Error-only readiness (EPOLLHUP/EPOLLERR with no data path).
            self.cancel_key(fd);
            return;
        }

        if wrapper.has_sendfile_data() {
            self.process_sendfile(fd, ready_ops);
            return;
        }

        // Clear ready ops from interest so the worker owns read/write.
        self.unreg(fd, ready_ops);

        let mut close_socket = false;
        if ready_ops & OP_READ != 0
            && !self
                .dispatcher
                .process_socket(&wrapper, SocketEvent::OpenRead, true)
        {
            close_socket = true;
        }
        if !close_socket
            && ready_ops & OP_WRITE != 0
            && !self
                .dispatcher
                .process_socket(&wrapper, SocketEvent::OpenWrite, true)
        {
            close_socket = true;
        }
        if close_socket {
            self.cancel_key(fd);
        }
    }

    fn unreg(&mut self, fd: i32, ready_ops: i32) {
        if let Some(key) = self.keys.get_mut(&fd) {
            let ops = key.interest_ops & !ready_ops;
            key.interest_ops = ops;
            key.wrapper.set_interest_ops(ops);
            if let Err(e) = self.epoll.modify(fd, fd as u64, ops) {
                trace!(fd, error = %e, "unreg failed");
            }
        }
    }

    fn reg(&mut self, fd: i32, ops: i32) {
        if let Some(key) = self.keys.get_mut(&fd) {
            key.interest_ops = ops;
            key.wrapper.set_interest_ops(ops);
            if let Err(e) = self.epoll.modify(fd, fd as u64, ops) {
                debug!(fd, error = %e, "re-registration failed, cancelling");
                self.cancel_key(fd);
            }
        }
    }

    /// Remove the registration and close the wrapper. The map entry goes
    /// first so no other path can observe a key for a closing socket.
    fn cancel_key(&mut self, fd: i32) {
        if let Some(key) = self.keys.remove(&fd) {
            let _ = self.epoll.delete(fd);
            key.wrapper.close();
        }
    }

    /// Continue a zero-copy transfer for a write-ready sendfile socket.
    fn process_sendfile(&mut self, fd: i32, ready_ops: i32) {
        self.unreg(fd, ready_ops);
        let Some(key) = self.keys.get(&fd) else { return };
        let wrapper = key.wrapper.clone();

        match run_sendfile(&wrapper) {
            SendfileState::Done => {
                let disposition = {
                    let mut slot = wrapper.sendfile_slot();
                    let disposition = slot
                        .as_ref()
                        .map(|d| d.keep_alive)
                        .unwrap_or(SendfileKeepAlive::None);
                    slot.take();
                    disposition
                };
                match disposition {
                    SendfileKeepAlive::None => {
                        debug!(fd, "sendfile complete, closing connection");
                        self.cancel_key(fd);
                    }
                    SendfileKeepAlive::Pipelined => {
                        debug!(fd, "sendfile complete, processing pipelined data");
                        if !self
                            .dispatcher
                            .process_socket(&wrapper, SocketEvent::OpenRead, true)
                        {
                            self.cancel_key(fd);
                        }
                    }
                    SendfileKeepAlive::Open => {
                        debug!(fd, "sendfile complete, re-registering for read");
                        self.reg(fd, OP_READ);
                    }
                }
            }
            SendfileState::Pending => {
                self.reg(fd, OP_WRITE);
            }
            SendfileState::Error => {
                debug!(fd, "sendfile failed");
                self.cancel_key(fd);
            }
        }
    }

    /// Idle/read/write timeout sweep. Throttled: runs when the selector
    /// came back empty, when the sweep interval expired, or on shutdown.
    /// Iterates over a snapshot so concurrent cancellation is harmless.
    fn timeout(&mut self, key_count: usize, has_events: bool) {
        let now = self.shared.now_ms();
        let close = self.ctl.is_closed();
        if self.next_expiration > 0
            && (key_count > 0 || has_events)
            && now < self.next_expiration
            && !close
        {
            return;
        }

        let fds: Vec<i32> = self.keys.keys().copied().collect();
        for fd in fds {
            let Some((wrapper, interest)) = self
                .keys
                .get(&fd)
                .map(|key| (key.wrapper.clone(), key.interest_ops))
            else {
                continue;
            };
            if wrapper.is_closed() {
                self.cancel_key(fd);
                continue;
            }
            if close {
                if let Some(key) = self.keys.get_mut(&fd) {
                    key.interest_ops = 0;
                }
                wrapper.set_interest_ops(0);
                self.cancel_key(fd);
                continue;
            }

            if interest & (OP_READ | OP_WRITE) == 0 {
                continue;
            }
            let mut timed_out = false;
            if interest & OP_READ != 0 {
                let timeout = wrapper.read_timeout_ms();
                if timeout > 0 && now.saturating_sub(wrapper.last_read()) > timeout {
                    timed_out = true;
                }
            }
            if !timed_out && interest & OP_WRITE != 0 {
                let timeout = wrapper.write_timeout_ms();
                if timeout > 0 && now.saturating_sub(wrapper.last_write()) > timeout {
                    timed_out = true;
                }
            }
            if timed_out {
                // Clear interest to avoid duplicate timeout dispatches.
                if let Some(key) = self.keys.get_mut(&fd) {
                    key.interest_ops = 0;
                }
                wrapper.set_interest_ops(0);
                let _ = self.epoll.modify(fd, fd as u64, 0);
                wrapper.set_error(SocketError::Timeout);
                self.shared.metrics.inc_timeout();
                warn!(fd, "connection timed out");
                if !self
                    .dispatcher
                    .process_socket(&wrapper, SocketEvent::Error, true)
                {
                    self.cancel_key(fd);
                }
            }
        }
        self.next_expiration = self.shared.now_ms() + self.timeout_interval_ms;
    }
}

/// Transfer as much of the attached file as the socket accepts right now.
/// Shared between the poller path and the processor's inline first write.
pub fn run_sendfile(wrapper: &Arc<SocketWrapper>) -> SendfileState {
    let mut slot = wrapper.sendfile_slot();
    let Some(data) = slot.as_mut() else {
        return SendfileState::Error;
    };

    if data.file.is_none() {
        match File::open(&data.path) {
            Ok(file) => data.file = Some(file),
            Err(e) => {
                debug!(path = %data.path, error = %e, "sendfile open failed");
                return SendfileState::Error;
            }
        }
    }
    let Some(mut file) = data.file.take() else {
        return SendfileState::Error;
    };

    while data.remaining > 0 {
        let written = if wrapper.is_secure() {
            // TLS writes go through the engine, not zero-copy.
            transfer_via_tls(wrapper, &mut file, data.pos, data.remaining)
        } else {
            transfer_zero_copy(wrapper, &file, data.pos, data.remaining)
        };
        match written {
            Ok(Some(0)) => {
                // File shorter than advertised.
                debug!(path = %data.path, "sendfile ran out of file data");
                return SendfileState::Error;
            }
            Ok(Some(n)) => {
                data.pos += n as u64;
                data.remaining -= (n as u64).min(data.remaining);
                wrapper.update_last_write();
            }
            Ok(None) => {
                data.file = Some(file);
                return SendfileState::Pending;
            }
            Err(e) => {
                debug!(path = %data.path, error = %e, "sendfile transfer failed");
                return SendfileState::Error;
            }
        }
    }
    SendfileState::Done
}

fn transfer_zero_copy(
    wrapper: &Arc<SocketWrapper>,
    file: &File,
    pos: u64,
    remaining: u64,
) -> KilnResult<Option<usize>> {
    use std::os::unix::io::AsRawFd;
    let chunk = remaining.min(512 * 1024) as usize;
    syscalls::sendfile(wrapper.fd(), file.as_raw_fd(), pos, chunk)
}

fn transfer_via_tls(
    wrapper: &Arc<SocketWrapper>,
    file: &mut File,
    pos: u64,
    remaining: u64,
) -> KilnResult<Option<usize>> {
    use std::io::{Read, Seek, SeekFrom};
    let chunk = remaining.min(16 * 1024) as usize;
    let mut buf = vec![0u8; chunk];
    file.seek(SeekFrom::Start(pos))?;
    let n = file.read(&mut buf)?;
    if n == 0 {
        return Ok(Some(0));
    }
    let written = wrapper.write(true, &buf[..n])?;
    Ok(Some(written))
}

/// First inline sendfile pass, run on the worker thread that produced the
/// response. A pending transfer is continued by the poller via a queued
/// WRITE interest.
pub fn process_sendfile_inline(wrapper: &Arc<SocketWrapper>) -> SendfileState {
    let state = run_sendfile(wrapper);
    match state {
        SendfileState::Pending => {
            wrapper.register_write_interest();
        }
        SendfileState::Done => {
            wrapper.sendfile_slot().take();
        }
        SendfileState::Error => {}
    }
    state
}
