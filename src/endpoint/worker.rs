use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace};

use super::pools::SyncStack;
use super::socket::SocketWrapper;
use super::tls::HandshakeStatus;
use super::EndpointShared;

/// Event a socket-processor task is parameterized with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    OpenRead,
    OpenWrite,
    Error,
    Disconnect,
    Stop,
    Timeout,
    ConnectFail,
}

/// State the protocol handler reports back after processing a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Keep-alive: re-register READ and wait for the next request.
    Open,
    /// Connection is finished; cancel and close.
    Closed,
    /// Mid-request wait; the protocol re-registers when it needs I/O.
    Long,
    /// Async completion processed.
    AsyncEnd,
    /// A file transfer owns the socket until it completes.
    Sendfile,
    /// Protocol switch finished.
    Upgraded,
    /// Protocol switch in progress (e.g. HTTP/2 preface seen).
    Upgrading,
    /// Externally suspended.
    Suspended,
}

/// The protocol attached to the endpoint (e.g. HTTP/1.1).
pub trait ProtocolHandler: Send + Sync {
    fn process(&self, wrapper: &Arc<SocketWrapper>, event: SocketEvent) -> SocketState;

    /// Connection is going away; drop any per-connection protocol state.
    /// Called from the wrapper's close path, so it must be idempotent.
    fn release(&self, wrapper: &SocketWrapper);

    /// Endpoint-wide teardown.
    fn recycle(&self) {}
}

/// Pooled per-dispatch task: drives the TLS handshake if one is pending,
/// then hands the socket to the protocol handler and applies the returned
/// state.
pub struct SocketProcessor {
    wrapper: Option<Arc<SocketWrapper>>,
    event: SocketEvent,
}

impl SocketProcessor {
    fn new(wrapper: Arc<SocketWrapper>, event: SocketEvent) -> Self {
        Self {
            wrapper: Some(wrapper),
            event,
        }
    }

    fn reset(&mut self, wrapper: Arc<SocketWrapper>, event: SocketEvent) {
        self.wrapper = Some(wrapper);
        self.event = event;
    }

    fn run(&mut self, ctx: &DispatchCtx) {
        let Some(wrapper) = self.wrapper.take() else {
            return;
        };
        let mut event = self.event;

        {
            let _guard = wrapper.lock_processing();

            let handshake = if wrapper.handshake_complete() {
                HandshakeStatus::Complete
            } else if matches!(
                event,
                SocketEvent::Stop | SocketEvent::Disconnect | SocketEvent::Error
            ) {
                // Cannot finish the handshake; treat as failed.
                HandshakeStatus::Failed
            } else {
                let status = wrapper.drive_handshake();
                if status == HandshakeStatus::Complete {
                    // Handshaking may have ended on a write; the socket is
                    // nonetheless readable-first once it completes.
                    event = SocketEvent::OpenRead;
                }
                status
            };

            match handshake {
                HandshakeStatus::Complete => {
                    let result = catch_unwind(AssertUnwindSafe(|| ctx.handler.process(&wrapper, event)));
                    match result {
                        // The wrapper's close path performs handler release.
                        Ok(SocketState::Closed) => wrapper.close(),
                        Ok(_) => {}
                        Err(_) => {
                            error!(fd = wrapper.fd(), "protocol handler panicked; closing connection");
                            wrapper.close();
                        }
                    }
                }
                HandshakeStatus::Failed => {
                    debug!(fd = wrapper.fd(), "TLS handshake failed");
                    ctx.handler.process(&wrapper, SocketEvent::ConnectFail);
                    wrapper.close();
                }
                HandshakeStatus::NeedRead => wrapper.register_read_interest(),
                HandshakeStatus::NeedWrite => wrapper.register_write_interest(),
            }
        }

        if ctx.shared.is_running() && !ctx.shared.is_paused() {
            if let Some(cache) = &ctx.processor_cache {
                let mut recycled = SocketProcessor {
                    wrapper: None,
                    event: SocketEvent::OpenRead,
                };
                std::mem::swap(self, &mut recycled);
                cache.push(recycled);
            }
        }
    }
}

/// Shared dispatch context: everything a running task needs.
pub struct DispatchCtx {
    pub shared: Arc<EndpointShared>,
    pub handler: Arc<dyn ProtocolHandler>,
    pub processor_cache: Option<SyncStack<SocketProcessor>>,
}

struct Job {
    processor: SocketProcessor,
    ctx: Arc<DispatchCtx>,
}

struct WorkerPoolInner {
    queue: Mutex<VecDeque<Job>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

/// Bounded pool of worker threads executing socket-processor tasks.
pub struct WorkerPool {
    inner: Arc<WorkerPoolInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let inner = Arc::new(WorkerPoolInner {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let inner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("kiln-worker-{i}"))
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            inner,
            handles: Mutex::new(handles),
        }
    }

    fn execute(&self, job: Job) -> bool {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return false;
        }
        self.inner.queue.lock().unwrap().push_back(job);
        self.inner.cond.notify_one();
        true
    }

    /// Stop accepting tasks, close the wrappers of anything still queued,
    /// and join the threads.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let pending: Vec<Job> = self.inner.queue.lock().unwrap().drain(..).collect();
        for job in pending {
            if let Some(wrapper) = job.processor.wrapper {
                wrapper.close();
            }
        }
        self.inner.cond.notify_all();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: &WorkerPoolInner) {
    trace!("worker thread started");
    loop {
        let job = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                queue = inner.cond.wait(queue).unwrap();
            }
        };
        let Some(mut job) = job else { break };
        let ctx = job.ctx.clone();
        job.processor.run(&ctx);
    }
    trace!("worker thread exiting");
}

/// Front door for socket processing: obtains a pooled task and either
/// dispatches it to the worker pool or runs it inline.
pub struct Dispatcher {
    pool: WorkerPool,
    pub ctx: Arc<DispatchCtx>,
}

impl Dispatcher {
    pub fn new(pool: WorkerPool, ctx: Arc<DispatchCtx>) -> Self {
        Self { pool, ctx }
    }

    /// Returns false if the task could not be submitted; the caller then
    /// cancels the key.
    pub fn process_socket(
        &self,
        wrapper: &Arc<SocketWrapper>,
        event: SocketEvent,
        dispatch: bool,
    ) -> bool {
        let processor = match &self.ctx.processor_cache {
            Some(cache) => cache.pop(),
            None => None,
        };
        let processor = match processor {
            Some(mut p) => {
                p.reset(wrapper.clone(), event);
                p
            }
            None => SocketProcessor::new(wrapper.clone(), event),
        };

        if dispatch {
            self.pool.execute(Job {
                processor,
                ctx: self.ctx.clone(),
            })
        } else {
            let mut processor = processor;
            processor.run(&self.ctx);
            true
        }
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.ctx.handler.recycle();
        if let Some(cache) = &self.ctx.processor_cache {
            cache.clear();
        }
    }
}
