use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::syscalls;

use super::latch::Gate;
use super::poller::PollerCtl;
use super::selector_pool::SelectorPool;
use super::socket::SocketWrapper;
use super::tls::TlsSession;
use super::{BufferPair, EndpointShared};

const INITIAL_ERROR_DELAY_MS: u64 = 50;
const MAX_ERROR_DELAY_MS: u64 = 1600;

/// Accepts new connections, applies admission control through the
/// connection-count latch, configures the socket and registers the new
/// channel wrapper with the poller.
pub struct Acceptor {
    shared: Arc<EndpointShared>,
    poller: Arc<PollerCtl>,
    selector_pool: Arc<SelectorPool>,
    pause_gate: Arc<Gate>,
    listen_fd: i32,
    tls_config: Option<Arc<rustls::ServerConfig>>,
}

impl Acceptor {
    pub fn new(
        shared: Arc<EndpointShared>,
        poller: Arc<PollerCtl>,
        selector_pool: Arc<SelectorPool>,
        pause_gate: Arc<Gate>,
        listen_fd: i32,
        tls_config: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        Self {
            shared,
            poller,
            selector_pool,
            pause_gate,
            listen_fd,
            tls_config,
        }
    }

    pub fn run(self) {
        info!(fd = self.listen_fd, "acceptor started");
        let mut error_delay = 0u64;

        loop {
            // Park while paused; the gate opens on resume and on stop.
            while self.shared.is_paused() && self.shared.is_running() {
                self.pause_gate.await_open();
            }
            if !self.shared.is_running() {
                break;
            }

            // Admission control: block at max_connections.
            let counted = match self.shared.connection_latch() {
                Some(latch) => {
                    if !latch.count_up_or_await() {
                        // Latch released: endpoint is stopping.
                        continue;
                    }
                    true
                }
                None => false,
            };

            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some(fd)) => {
                    error_delay = 0;
                    if self.shared.is_running() && !self.shared.is_paused() {
                        if !self.setup_socket(fd) {
                            // Configuration failure closes the socket and
                            // releases the permit; counts never leak.
                            if counted {
                                self.shared.count_down_connection();
                            }
                            syscalls::close_fd(fd);
                        }
                    } else {
                        if counted {
                            self.shared.count_down_connection();
                        }
                        syscalls::close_fd(fd);
                    }
                }
                Ok(None) => {
                    // Raced with an unlock connection; nothing accepted.
                    if counted {
                        self.shared.count_down_connection();
                    }
                }
                Err(e) => {
                    if counted {
                        self.shared.count_down_connection();
                    }
                    if self.shared.is_running() {
                        error_delay = if error_delay == 0 {
                            INITIAL_ERROR_DELAY_MS
                        } else {
                            (error_delay * 2).min(MAX_ERROR_DELAY_MS)
                        };
                        error!(error = %e, delay_ms = error_delay, "accept failed");
                        std::thread::sleep(Duration::from_millis(error_delay));
                    }
                }
            }
        }
        info!("acceptor exiting");
    }

    /// Configure the accepted socket, wrap it and hand it to the poller.
    /// Returns false if the socket must be closed by the caller.
    fn setup_socket(&self, fd: i32) -> bool {
        let config = &self.shared.config;
        if let Err(e) = syscalls::configure_socket(fd, &config.socket) {
            warn!(fd, error = %e, "socket option configuration failed");
            return false;
        }

        let buffers = match &self.shared.buffer_cache {
            Some(cache) => cache.pop(),
            None => None,
        }
        .unwrap_or_else(|| BufferPair::allocate(config));

        let tls = match &self.tls_config {
            None => None,
            Some(tls_config) => match TlsSession::new(tls_config.clone()) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(fd, error = %e, "TLS session creation failed");
                    return false;
                }
            },
        };

        let wrapper = Arc::new(SocketWrapper::new(
            fd,
            self.shared.clone(),
            self.poller.clone(),
            self.selector_pool.clone(),
            buffers.read,
            buffers.write,
            tls,
        ));
        wrapper.set_read_timeout(Duration::from_millis(config.connection_timeout_ms));
        wrapper.set_write_timeout(Duration::from_millis(config.connection_timeout_ms));
        wrapper.set_keep_alive_left(config.max_keep_alive_requests);

        self.shared
            .connections
            .lock()
            .unwrap()
            .insert(fd, wrapper.clone());
        self.shared.metrics.inc_conn();
        debug!(fd, "connection accepted");

        // From here the wrapper owns the permit; its close releases it.
        self.poller.register(wrapper);
        true
    }
}
