//! The NIO-style endpoint: one acceptor thread, one poller thread, a
//! bounded worker pool, pooled per-connection state, and blocking worker
//! I/O through a secondary selector pool.

pub mod acceptor;
pub mod buffer;
pub mod latch;
pub mod poller;
pub mod pools;
pub mod selector_pool;
pub mod socket;
pub mod tls;
pub mod worker;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::lifecycle::{Lifecycle, LifecycleSupport};
use crate::metrics::EndpointMetrics;
use crate::syscalls;

use acceptor::Acceptor;
use buffer::SocketBuffer;
use latch::{Gate, LimitLatch, StopLatch};
use poller::{Poller, PollerCtl};
use pools::SyncStack;
use selector_pool::SelectorPool;
use socket::SocketWrapper;
use worker::{DispatchCtx, Dispatcher, ProtocolHandler, WorkerPool};

/// Read/write buffer pair recycled between connections.
pub struct BufferPair {
    pub read: SocketBuffer,
    pub write: SocketBuffer,
}

impl BufferPair {
    /// Fresh pair sized from the configuration. The read buffer must hold
    /// the whole header block plus one socket read.
    pub fn allocate(config: &Config) -> Self {
        Self {
            read: SocketBuffer::with_capacity(config.max_http_header_size + config.app_read_buf_size),
            write: SocketBuffer::with_capacity(config.app_write_buf_size),
        }
    }

    /// Re-pool a pair from a closed connection.
    pub fn recycled(mut read: SocketBuffer, mut write: SocketBuffer) -> Self {
        read.reset_empty();
        write.reset_empty();
        Self { read, write }
    }
}

/// State shared between the endpoint, its threads and every channel
/// wrapper. Wrappers deregister themselves here on close.
pub struct EndpointShared {
    pub config: Config,
    pub metrics: EndpointMetrics,
    pub connections: Mutex<HashMap<i32, Arc<SocketWrapper>>>,
    pub buffer_cache: Option<SyncStack<BufferPair>>,
    running: AtomicBool,
    paused: AtomicBool,
    connection_latch: Mutex<Option<Arc<LimitLatch>>>,
    stop_latch: Mutex<Arc<StopLatch>>,
    // Wrappers detach their protocol state through this on close.
    handler: Mutex<Option<Arc<dyn ProtocolHandler>>>,
    epoch: Instant,
}

impl EndpointShared {
    fn new(config: Config) -> Self {
        let buffer_cache = if config.buffer_pool > 0 {
            Some(SyncStack::new(config.buffer_pool))
        } else {
            None
        };
        Self {
            config,
            metrics: EndpointMetrics::new(),
            connections: Mutex::new(HashMap::new()),
            buffer_cache,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            connection_latch: Mutex::new(None),
            stop_latch: Mutex::new(Arc::new(StopLatch::new(0))),
            handler: Mutex::new(None),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the endpoint came up; the time base for
    /// last-read/last-write stamps and the timeout sweep.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn connection_latch(&self) -> Option<Arc<LimitLatch>> {
        self.connection_latch.lock().unwrap().clone()
    }

    pub fn count_down_connection(&self) {
        if let Some(latch) = self.connection_latch() {
            latch.count_down();
        }
    }

    pub fn stop_latch(&self) -> Arc<StopLatch> {
        self.stop_latch.lock().unwrap().clone()
    }

    pub fn protocol_handler(&self) -> Option<Arc<dyn ProtocolHandler>> {
        self.handler.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

/// The socket endpoint. Lifecycle: `bind` on init, acceptor + poller +
/// workers on start; `pause`/`resume` gate the acceptor; `stop` drains
/// everything; `destroy` releases the listen socket.
pub struct Endpoint {
    lifecycle: LifecycleSupport,
    shared: Arc<EndpointShared>,
    selector_pool: Arc<SelectorPool>,
    pause_gate: Arc<Gate>,
    handler: Mutex<Option<Arc<dyn ProtocolHandler>>>,
    listen_fd: Mutex<Option<i32>>,
    bound_addr: Mutex<Option<SocketAddr>>,
    tls_config: Mutex<Option<Arc<rustls::ServerConfig>>>,
    poller_ctl: Mutex<Option<Arc<PollerCtl>>>,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    wake_fds: Mutex<Option<(i32, i32)>>,
}

impl Endpoint {
    pub fn new(config: Config) -> Self {
        let selector_pool = Arc::new(SelectorPool::new(config.selector_pool_size));
        Self {
            lifecycle: LifecycleSupport::new(),
            shared: Arc::new(EndpointShared::new(config)),
            selector_pool,
            pause_gate: Arc::new(Gate::new(true)),
            handler: Mutex::new(None),
            listen_fd: Mutex::new(None),
            bound_addr: Mutex::new(None),
            tls_config: Mutex::new(None),
            poller_ctl: Mutex::new(None),
            dispatcher: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            wake_fds: Mutex::new(None),
        }
    }

    pub fn shared(&self) -> &Arc<EndpointShared> {
        &self.shared
    }

    pub fn metrics(&self) -> &EndpointMetrics {
        &self.shared.metrics
    }

    /// Attach the protocol (e.g. HTTP/1.1) before starting.
    pub fn set_handler(&self, handler: Arc<dyn ProtocolHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// Address the listen socket is actually bound to (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }

    /// Bind the listen socket (or adopt the inherited one) and initialize
    /// TLS. Runs as part of `init()`.
    fn bind(&self) -> KilnResult<()> {
        let config = &self.shared.config;

        let fd = match config.inherited_fd {
            Some(fd) => {
                info!(fd, "adopting inherited listen socket");
                syscalls::adopt_inherited_socket(fd)?
            }
            None => {
                let addr: SocketAddr = config
                    .server_addr()
                    .parse()
                    .map_err(|e| KilnError::Other(format!("invalid bind address: {e}")))?;
                syscalls::create_listen_socket(&addr, &config.socket, config.accept_count)?
            }
        };
        let bound = syscalls::local_addr(fd)?;
        info!(%bound, "listen socket bound");

        if config.tls.enabled {
            let tls_config = tls::build_server_config(&config.tls)?;
            *self.tls_config.lock().unwrap() = Some(tls_config);
        }

        *self.listen_fd.lock().unwrap() = Some(fd);
        *self.bound_addr.lock().unwrap() = Some(bound);
        Ok(())
    }

    /// Suspend accepting. Existing connections continue to be served.
    pub fn pause(&self) {
        if self.shared.is_running() && !self.shared.is_paused() {
            info!("endpoint pausing");
            self.shared.paused.store(true, Ordering::Release);
            self.pause_gate.set_open(false);
            // A blocked accept(2) only notices the pause once a connection
            // arrives; make one.
            if let Some(addr) = self.local_addr() {
                syscalls::unlock_accept(&addr);
            }
        }
    }

    /// Resume accepting after a pause.
    pub fn resume(&self) {
        if self.shared.is_running() && self.shared.is_paused() {
            info!("endpoint resuming");
            self.shared.paused.store(false, Ordering::Release);
            self.pause_gate.set_open(true);
        }
    }
}

impl Lifecycle for Endpoint {
    fn lifecycle(&self) -> &LifecycleSupport {
        &self.lifecycle
    }

    fn init_internal(&self) -> KilnResult<()> {
        self.bind()
    }

    fn start_internal(&self) -> KilnResult<()> {
        let config = self.shared.config.clone();
        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| KilnError::Lifecycle("no protocol handler attached".into()))?;
        let listen_fd = self
            .listen_fd
            .lock()
            .unwrap()
            .ok_or_else(|| KilnError::Lifecycle("endpoint is not bound".into()))?;

        self.shared.running.store(true, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);
        self.pause_gate.set_open(true);
        *self.shared.handler.lock().unwrap() = Some(handler.clone());

        *self.shared.connection_latch.lock().unwrap() = if config.max_connections > 0 {
            Some(Arc::new(LimitLatch::new(config.max_connections)))
        } else {
            None
        };
        *self.shared.stop_latch.lock().unwrap() = Arc::new(StopLatch::new(1));

        let (wake_rx, wake_tx) = syscalls::create_pipe()?;
        *self.wake_fds.lock().unwrap() = Some((wake_rx, wake_tx));

        let poller_ctl = Arc::new(PollerCtl::new(wake_tx, config.event_cache));
        *self.poller_ctl.lock().unwrap() = Some(poller_ctl.clone());

        let processor_cache = if config.processor_cache > 0 {
            Some(SyncStack::new(config.processor_cache))
        } else {
            None
        };
        let ctx = Arc::new(DispatchCtx {
            shared: self.shared.clone(),
            handler,
            processor_cache,
        });
        let worker_pool = WorkerPool::new(config.worker_threads.max(1));
        let dispatcher = Arc::new(Dispatcher::new(worker_pool, ctx));
        *self.dispatcher.lock().unwrap() = Some(dispatcher.clone());

        let poller = Poller::new(
            poller_ctl.clone(),
            self.shared.clone(),
            dispatcher.clone(),
            wake_rx,
        )?;
        let poller_thread = thread::Builder::new()
            .name("kiln-poller".to_string())
            .spawn(move || poller.run())
            .map_err(|e| KilnError::Other(format!("failed to spawn poller: {e}")))?;

        let acceptor = Acceptor::new(
            self.shared.clone(),
            poller_ctl,
            self.selector_pool.clone(),
            self.pause_gate.clone(),
            listen_fd,
            self.tls_config.lock().unwrap().clone(),
        );
        let acceptor_thread = thread::Builder::new()
            .name("kiln-acceptor".to_string())
            .spawn(move || acceptor.run())
            .map_err(|e| KilnError::Other(format!("failed to spawn acceptor: {e}")))?;

        let mut threads = self.threads.lock().unwrap();
        threads.push(poller_thread);
        threads.push(acceptor_thread);

        info!(
            addr = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            workers = config.worker_threads,
            "endpoint started"
        );
        Ok(())
    }

    fn stop_internal(&self) -> KilnResult<()> {
        if !self.shared.is_paused() {
            self.pause();
        }
        if !self.shared.is_running() {
            return Ok(());
        }
        info!("endpoint stopping");
        self.shared.running.store(false, Ordering::Release);

        // Wake everything that might be parked: the pause gate, the
        // connection latch and a blocked accept.
        self.pause_gate.set_open(true);
        if let Some(latch) = self.shared.connection_latch() {
            latch.release_all();
        }
        if let Some(addr) = self.local_addr() {
            syscalls::unlock_accept(&addr);
        }

        if let Some(ctl) = self.poller_ctl.lock().unwrap().take() {
            ctl.shutdown();
        }

        let stop_latch = self.shared.stop_latch();
        let bound = Duration::from_millis(self.shared.config.selector_timeout_ms + 100);
        if !stop_latch.await_for(bound) {
            warn!("poller stop latch await timed out");
        }

        let handles: Vec<JoinHandle<()>> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        if let Some(dispatcher) = self.dispatcher.lock().unwrap().take() {
            dispatcher.shutdown();
        }

        // Anything the poller did not cancel (e.g. sockets never
        // registered) is closed here; the map must end empty.
        let leftover: Vec<Arc<SocketWrapper>> = self
            .shared
            .connections
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for wrapper in leftover {
            wrapper.close();
        }
        debug_assert_eq!(self.shared.connection_count(), 0);

        if let Some((wake_rx, wake_tx)) = self.wake_fds.lock().unwrap().take() {
            syscalls::close_fd(wake_rx);
            syscalls::close_fd(wake_tx);
        }
        if let Some(cache) = &self.shared.buffer_cache {
            cache.clear();
        }
        *self.shared.connection_latch.lock().unwrap() = None;
        *self.shared.handler.lock().unwrap() = None;
        info!("endpoint stopped");
        Ok(())
    }

    fn destroy_internal(&self) -> KilnResult<()> {
        if let Some(fd) = self.listen_fd.lock().unwrap().take() {
            // Inherited sockets belong to the invoking process.
            if self.shared.config.inherited_fd.is_none() {
                syscalls::close_fd(fd);
            }
        }
        *self.bound_addr.lock().unwrap() = None;
        self.selector_pool.close();
        debug!("endpoint destroyed");
        Ok(())
    }
}
