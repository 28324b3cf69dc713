//! HTTP/1.1 protocol driver: one processor per live connection, pooled
//! and re-associated as connections come and go.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, trace};

use crate::config::Config;
use crate::endpoint::pools::SyncStack;
use crate::endpoint::socket::{SendfileData, SendfileKeepAlive, SocketWrapper};
use crate::endpoint::poller::{process_sendfile_inline, SendfileState};
use crate::endpoint::worker::{ProtocolHandler, SocketEvent, SocketState};
use crate::error::{KilnError, KilnResult};

use super::filters::{ChunkedInputFilter, IdentityInputFilter, VoidInputFilter};
use super::input_buffer::HttpInputBuffer;
use super::request::HttpRequest;
use super::response::{write_continue, write_response, HttpResponse};
use super::tokens::HttpTokens;

/// Bridge between the protocol and the container pipeline.
pub trait Adapter: Send + Sync {
    fn service(&self, request: &mut HttpRequest, response: &mut HttpResponse) -> KilnResult<()>;
}

/// Outcome of one service pass over a connection.
enum RequestOutcome {
    /// Free the thread; the poller re-arms READ.
    NeedMoreData,
    /// HTTP/2 preface seen.
    SwitchProtocol,
    Continue,
    Close,
    /// A sendfile transfer now owns the socket.
    SendfilePending,
}

/// Per-connection HTTP/1.1 state machine.
pub struct Http11Processor {
    input: HttpInputBuffer,
    request: HttpRequest,
    response: HttpResponse,
    kept_alive: bool,
}

impl Http11Processor {
    fn new(config: &Config, tokens: Arc<HttpTokens>) -> Self {
        Self {
            input: HttpInputBuffer::new(
                config.max_http_header_size,
                config.app_read_buf_size,
                config.reject_illegal_header,
                tokens,
            ),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            kept_alive: false,
        }
    }

    /// Reset for reuse on another connection. Returns false when the
    /// connection's read buffer could not be cleared (a worker is still
    /// unwinding); the processor is then discarded instead of pooled.
    fn try_recycle(&mut self, wrapper: &SocketWrapper) -> bool {
        let Ok(mut buf) = wrapper.read_buffer.try_lock() else {
            return false;
        };
        self.input.recycle(&mut buf);
        self.request.recycle();
        self.response.recycle();
        self.kept_alive = false;
        true
    }

    /// Serve as many pipelined requests as the buffer holds, then yield.
    fn process(
        &mut self,
        wrapper: &Arc<SocketWrapper>,
        adapter: &Arc<dyn Adapter>,
        config: &Config,
        event: SocketEvent,
    ) -> SocketState {
        if !matches!(event, SocketEvent::OpenRead | SocketEvent::OpenWrite) {
            return SocketState::Closed;
        }

        loop {
            match self.service_one(wrapper, adapter, config) {
                Ok(RequestOutcome::NeedMoreData) => return SocketState::Open,
                Ok(RequestOutcome::SwitchProtocol) => return SocketState::Upgrading,
                Ok(RequestOutcome::Continue) => continue,
                Ok(RequestOutcome::Close) => return SocketState::Closed,
                Ok(RequestOutcome::SendfilePending) => return SocketState::Sendfile,
                Err(e) => {
                    debug!(fd = wrapper.fd(), error = %e, "request processing failed");
                    return SocketState::Closed;
                }
            }
        }
    }

    fn service_one(
        &mut self,
        wrapper: &Arc<SocketWrapper>,
        adapter: &Arc<dyn Adapter>,
        config: &Config,
    ) -> KilnResult<RequestOutcome> {
        let mut src = wrapper.clone();

        // ---- Request line ----
        {
            let mut buf = wrapper.read_buffer.lock().unwrap();
            let parsed = self.input.parse_request_line(
                &mut buf,
                &mut src,
                &mut self.request,
                self.kept_alive,
                config.connection_timeout_ms,
                config.keep_alive_timeout_ms,
            );
            match parsed {
                Ok(true) => {}
                Ok(false) => {
                    if self.input.parsing_phase() == -1 {
                        debug!(fd = wrapper.fd(), "HTTP/2 client preface received");
                        return Ok(RequestOutcome::SwitchProtocol);
                    }
                    return Ok(RequestOutcome::NeedMoreData);
                }
                Err(KilnError::Parse(e)) => {
                    drop(buf);
                    wrapper.endpoint().metrics.inc_parse_failure();
                    debug!(fd = wrapper.fd(), error = %e, "bad request line");
                    self.send_error(wrapper, 400)?;
                    return Ok(RequestOutcome::Close);
                }
                Err(e) => {
                    trace!(fd = wrapper.fd(), error = %e, "connection ended before a request");
                    return Ok(RequestOutcome::Close);
                }
            }

            // ---- Headers (none for HTTP/0.9) ----
            if !self.request.is_http09() {
                match self
                    .input
                    .parse_headers(&mut buf, &mut src, &mut self.request)
                {
                    Ok(true) => {}
                    Ok(false) => return Ok(RequestOutcome::NeedMoreData),
                    Err(KilnError::Parse(e)) => {
                        drop(buf);
                        wrapper.endpoint().metrics.inc_parse_failure();
                        debug!(fd = wrapper.fd(), error = %e, "bad request headers");
                        self.send_error(wrapper, 400)?;
                        return Ok(RequestOutcome::Close);
                    }
                    Err(e) => {
                        debug!(fd = wrapper.fd(), error = %e, "header read failed");
                        return Ok(RequestOutcome::Close);
                    }
                }
            }
        }

        // A paused endpoint finishes nothing new.
        if wrapper.endpoint().is_paused() {
            self.send_error(wrapper, 503)?;
            return Ok(RequestOutcome::Close);
        }

        // ---- Prepare ----
        let mut keep_alive = match self.prepare_request(config) {
            Ok(keep_alive) => keep_alive,
            Err(KilnError::Parse(e)) => {
                wrapper.endpoint().metrics.inc_parse_failure();
                debug!(fd = wrapper.fd(), error = %e, "unprocessable request");
                self.send_error(wrapper, 400)?;
                return Ok(RequestOutcome::Close);
            }
            Err(e) => return Err(e),
        };

        // The budget counts every request served on the connection.
        let left = wrapper.decrement_keep_alive();
        if left == 0 {
            keep_alive = false;
        }

        if !self.request.is_http09()
            && self
                .request
                .headers
                .get("expect")
                .map(|v| v.eq_ignore_ascii_case("100-continue"))
                .unwrap_or(false)
        {
            write_continue(wrapper)?;
        }

        // ---- Container dispatch ----
        if let Err(e) = adapter.service(&mut self.request, &mut self.response) {
            debug!(fd = wrapper.fd(), error = %e, "service failed");
            if !self.response.is_committed() {
                self.response.recycle();
                self.response.set_status(500);
            }
            // Whether the failure was before or after the commit, the
            // connection is not reusable.
            keep_alive = false;
            self.input.set_swallow_input(false);
        }

        // ---- Response ----
        let http09 = self.request.is_http09();
        let head = self.request.method == "HEAD";
        if !self.response.is_committed() {
            write_response(wrapper, &mut self.response, keep_alive, http09, head)?;
        }
        wrapper.endpoint().metrics.inc_req();
        self.kept_alive = true;

        // ---- Drain the body so the connection is reusable ----
        {
            let mut buf = wrapper.read_buffer.lock().unwrap();
            self.input.end_request(&mut buf, &mut src)?;
        }

        // ---- Sendfile ----
        if let Some(sf) = self.response.take_sendfile() {
            let disposition = {
                let buf = wrapper.read_buffer.lock().unwrap();
                if !keep_alive {
                    SendfileKeepAlive::None
                } else if buf.remaining() > 0 {
                    SendfileKeepAlive::Pipelined
                } else {
                    SendfileKeepAlive::Open
                }
            };
            wrapper.set_sendfile_data(Some(SendfileData::new(
                sf.path,
                sf.pos,
                sf.length,
                disposition,
            )));
            self.next_request(wrapper);
            return match process_sendfile_inline(wrapper) {
                SendfileState::Done => match disposition {
                    SendfileKeepAlive::None => Ok(RequestOutcome::Close),
                    SendfileKeepAlive::Pipelined => Ok(RequestOutcome::Continue),
                    SendfileKeepAlive::Open => Ok(RequestOutcome::NeedMoreData),
                },
                SendfileState::Pending => Ok(RequestOutcome::SendfilePending),
                SendfileState::Error => Ok(RequestOutcome::Close),
            };
        }

        if !keep_alive {
            return Ok(RequestOutcome::Close);
        }

        // ---- Next request: same wrapper, reset state ----
        let pipelined = {
            let buf = wrapper.read_buffer.lock().unwrap();
            buf.remaining() > 0
        };
        self.next_request(wrapper);
        if pipelined {
            Ok(RequestOutcome::Continue)
        } else {
            Ok(RequestOutcome::NeedMoreData)
        }
    }

    /// Decide keep-alive and install the body filter chain.
    fn prepare_request(&mut self, config: &Config) -> KilnResult<bool> {
        let req = &mut self.request;
        let mut keep_alive = if req.is_http09() {
            false
        } else if req.is_http11() {
            true
        } else {
            // HTTP/1.0 keeps alive only on request.
            req.headers
                .get("connection")
                .map(|v| has_token(v, "keep-alive"))
                .unwrap_or(false)
        };
        if let Some(connection) = req.headers.get("connection") {
            if has_token(connection, "close") {
                keep_alive = false;
            }
        }
        if !config.keep_alive_enabled() {
            keep_alive = false;
        }

        // Body delimitation. Transfer-Encoding wins; both present is a
        // smuggling vector and is rejected.
        let chunked = req
            .headers
            .get("transfer-encoding")
            .map(|v| has_token(v, "chunked"))
            .unwrap_or(false);
        let content_length = match req.headers.get("content-length") {
            None => -1,
            Some(v) => v
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|n| *n >= 0)
                .ok_or(crate::error::HttpParseError::InvalidHeader(
                    "content-length".to_string(),
                ))?,
        };
        if chunked && content_length >= 0 {
            return Err(crate::error::HttpParseError::InvalidHeader(
                "content-length with chunked transfer-encoding".to_string(),
            )
            .into());
        }

        if chunked {
            req.content_length = -1;
            self.input
                .filters
                .add_active(Box::new(ChunkedInputFilter::new()));
        } else if content_length >= 0 {
            req.content_length = content_length;
            self.input
                .filters
                .add_active(Box::new(IdentityInputFilter::new(content_length)));
        } else {
            req.content_length = 0;
            self.input.filters.add_active(Box::new(VoidInputFilter));
        }

        Ok(keep_alive)
    }

    fn next_request(&mut self, wrapper: &Arc<SocketWrapper>) {
        let mut buf = wrapper.read_buffer.lock().unwrap();
        self.input.next_request(&mut buf);
        self.request.recycle();
        self.response.recycle();
    }

    fn send_error(&mut self, wrapper: &Arc<SocketWrapper>, status: u16) -> KilnResult<()> {
        self.response.recycle();
        self.response.set_status(status);
        self.response.set_header("Content-Type", "text/plain");
        self.response
            .write(format!("{status}\r\n").as_bytes());
        // Best effort: the peer may already be gone.
        let _ = write_response(wrapper, &mut self.response, false, false, false);
        Ok(())
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// The endpoint-facing HTTP/1.1 protocol handler: associates processors
/// with connections and recycles them through a bounded cache.
pub struct Http11Handler {
    adapter: Arc<dyn Adapter>,
    config: Config,
    tokens: Arc<HttpTokens>,
    // Keyed by the wrapper's connection id, never its fd: fds are reused
    // by the OS while a stale association could still exist.
    connections: Mutex<HashMap<u64, Http11Processor>>,
    recycled: SyncStack<Http11Processor>,
}

impl Http11Handler {
    pub fn new(adapter: Arc<dyn Adapter>, config: Config) -> Self {
        let tokens = Arc::new(HttpTokens::new(
            &config.relaxed_path_chars,
            &config.relaxed_query_chars,
        ));
        let cache = config.processor_cache.max(1);
        Self {
            adapter,
            config,
            tokens,
            connections: Mutex::new(HashMap::new()),
            recycled: SyncStack::new(cache),
        }
    }

    fn take_processor(&self, id: u64) -> Http11Processor {
        if let Some(processor) = self.connections.lock().unwrap().remove(&id) {
            return processor;
        }
        self.recycled
            .pop()
            .unwrap_or_else(|| Http11Processor::new(&self.config, self.tokens.clone()))
    }

    fn recycle_processor(&self, mut processor: Http11Processor, wrapper: &SocketWrapper) {
        if processor.try_recycle(wrapper) {
            self.recycled.push(processor);
        }
    }
}

impl ProtocolHandler for Http11Handler {
    fn process(&self, wrapper: &Arc<SocketWrapper>, event: SocketEvent) -> SocketState {
        match event {
            SocketEvent::Stop | SocketEvent::Disconnect | SocketEvent::ConnectFail => {
                self.release(wrapper);
                return SocketState::Closed;
            }
            SocketEvent::Error | SocketEvent::Timeout => {
                trace!(fd = wrapper.fd(), "connection errored or timed out");
                self.release(wrapper);
                return SocketState::Closed;
            }
            SocketEvent::OpenRead | SocketEvent::OpenWrite => {}
        }

        let mut processor = self.take_processor(wrapper.id());
        let state = processor.process(wrapper, &self.adapter, &self.config, event);
        match state {
            SocketState::Open => {
                // Waiting for the next request bytes; keep the processor
                // associated and re-arm read interest.
                self.connections
                    .lock()
                    .unwrap()
                    .insert(wrapper.id(), processor);
                wrapper.register_read_interest();
            }
            SocketState::Sendfile | SocketState::Long | SocketState::Suspended => {
                self.connections
                    .lock()
                    .unwrap()
                    .insert(wrapper.id(), processor);
            }
            SocketState::Upgrading | SocketState::Upgraded => {
                // Only the HTTP/2 preface is recognized; no upgrade
                // protocol is wired in, so the connection closes.
                info!(fd = wrapper.fd(), "protocol upgrade requested but unsupported; closing");
                self.recycle_processor(processor, wrapper);
                return SocketState::Closed;
            }
            SocketState::Closed | SocketState::AsyncEnd => {
                self.recycle_processor(processor, wrapper);
                return SocketState::Closed;
            }
        }
        state
    }

    fn release(&self, wrapper: &SocketWrapper) {
        if let Some(processor) = self.connections.lock().unwrap().remove(&wrapper.id()) {
            self.recycle_processor(processor, wrapper);
        }
    }

    fn recycle(&self) {
        self.connections.lock().unwrap().clear();
        self.recycled.clear();
    }
}
