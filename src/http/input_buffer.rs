//! Incremental, resumable parsing of the HTTP/1.1 request line and
//! headers from a byte buffer shared with the socket reader.
//!
//! The parser is a state machine indexed by a phase counter so that no
//! blocking is ever required: any method that runs out of bytes returns a
//! need-more-data status with every cursor positioned to continue on the
//! next call.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::endpoint::buffer::SocketBuffer;
use crate::endpoint::socket::SocketWrapper;
use crate::error::{HttpParseError, KilnError, KilnResult};

use super::filters::{FilterChain, SocketInput};
use super::request::HttpRequest;
use super::tokens::{self, HttpTokens};

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const SP: u8 = b' ';
const HT: u8 = b'\t';
const COLON: u8 = b':';
const QUESTION: u8 = b'?';

/// The 24-byte HTTP/2 connection preface, recognized at position 0 of a
/// connection that has not served a request yet.
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Byte source feeding the parse buffer. The endpoint's channel wrapper is
/// the production implementation; tests use scripted sources.
pub trait InputSource {
    /// Read into `dst`: n > 0 bytes were appended, 0 means no data in
    /// non-blocking mode, -1 is end of stream.
    fn read(&mut self, block: bool, dst: &mut [u8]) -> KilnResult<isize>;

    /// Adjust the connection's read timeout (keep-alive vs in-request).
    fn set_read_timeout_ms(&mut self, _timeout_ms: u64) {}
}

impl InputSource for Arc<SocketWrapper> {
    fn read(&mut self, block: bool, dst: &mut [u8]) -> KilnResult<isize> {
        (**self).read(block, dst)
    }

    fn set_read_timeout_ms(&mut self, timeout_ms: u64) {
        (**self).set_read_timeout(std::time::Duration::from_millis(timeout_ms));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderParseStatus {
    Done,
    HaveMoreHeaders,
    NeedMoreData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderParsePosition {
    /// Start of a new header. CRLF here means no more headers.
    HeaderStart,
    /// Reading the name; token bytes only, ended by ':'.
    HeaderName,
    /// Skipping whitespace before a value (or a folded continuation).
    HeaderValueStart,
    /// Inside the value, compacting whitespace in place.
    HeaderValue,
    /// Peeking one byte past CRLF to detect obsolete line folding.
    HeaderMultiLine,
    /// Consuming a malformed line through its CRLF.
    HeaderSkipLine,
}

/// Cursors for the header currently being parsed. `real_pos` compacts the
/// value in place; the committed value is `[start, last_significant)`.
#[derive(Debug, Default)]
struct HeaderParseData {
    line_start: usize,
    start: usize,
    real_pos: usize,
    last_significant: usize,
    header_index: Option<usize>,
}

impl HeaderParseData {
    fn recycle(&mut self) {
        self.line_start = 0;
        self.start = 0;
        self.real_pos = 0;
        self.last_significant = 0;
        self.header_index = None;
    }
}

/// Stateful request-line/header parser plus the request-body filter chain.
pub struct HttpInputBuffer {
    header_buffer_size: usize,
    socket_read_buffer_size: usize,
    reject_illegal_header: bool,
    tokens: Arc<HttpTokens>,

    parsing_header: bool,
    swallow_input: bool,
    /// Start of the body once headers complete.
    end: usize,

    parsing_request_line: bool,
    phase: i8,
    eol: bool,
    start_pos: usize,
    q_pos: isize,
    line_end: usize,
    prev_chr: u8,
    chr: u8,

    header_pos: HeaderParsePosition,
    header_data: HeaderParseData,

    pub filters: FilterChain,
}

impl HttpInputBuffer {
    pub fn new(
        header_buffer_size: usize,
        socket_read_buffer_size: usize,
        reject_illegal_header: bool,
        tokens: Arc<HttpTokens>,
    ) -> Self {
        Self {
            header_buffer_size,
            socket_read_buffer_size,
            reject_illegal_header,
            tokens,
            parsing_header: true,
            swallow_input: true,
            end: 0,
            parsing_request_line: true,
            phase: 0,
            eol: false,
            start_pos: 0,
            q_pos: -1,
            line_end: 0,
            prev_chr: 0,
            chr: 0,
            header_pos: HeaderParsePosition::HeaderStart,
            header_data: HeaderParseData::default(),
            filters: FilterChain::new(),
        }
    }

    /// -1 after an HTTP/2 preface match; the caller switches protocols.
    pub fn parsing_phase(&self) -> i8 {
        self.phase
    }

    pub fn body_start(&self) -> usize {
        self.end
    }

    pub fn set_swallow_input(&mut self, swallow: bool) {
        self.swallow_input = swallow;
    }

    /// Full reset when the connection is recycled.
    pub fn recycle(&mut self, buf: &mut SocketBuffer) {
        buf.reset_empty();
        self.filters.recycle();
        self.parsing_header = true;
        self.swallow_input = true;
        self.end = 0;
        self.chr = 0;
        self.prev_chr = 0;
        self.header_pos = HeaderParsePosition::HeaderStart;
        self.parsing_request_line = true;
        self.phase = 0;
        self.eol = false;
        self.start_pos = 0;
        self.q_pos = -1;
        self.line_end = 0;
        self.header_data.recycle();
    }

    /// Reset pointers for the next request of a keep-alive connection.
    /// Unconsumed pipelined bytes move to the front of the buffer.
    pub fn next_request(&mut self, buf: &mut SocketBuffer) {
        if buf.position() > 0 {
            if buf.remaining() > 0 {
                buf.compact_flip();
            } else {
                buf.reset_empty();
            }
        }
        self.filters.recycle();
        self.parsing_header = true;
        self.swallow_input = true;
        self.end = 0;
        self.header_pos = HeaderParsePosition::HeaderStart;
        self.parsing_request_line = true;
        self.phase = 0;
        self.eol = false;
        self.start_pos = 0;
        self.q_pos = -1;
        self.line_end = 0;
        self.header_data.recycle();
    }

    /// Attempt to add bytes to the parse buffer.
    ///
    /// Appends at the buffer's limit; while parsing headers the cumulative
    /// length is bounded by the header budget. Returns true iff bytes were
    /// read.
    fn fill(
        &mut self,
        buf: &mut SocketBuffer,
        src: &mut dyn InputSource,
        req: &mut HttpRequest,
        block: bool,
    ) -> KilnResult<bool> {
        // Body-phase refills go through the filter chain's own fill; this
        // one only runs under the header budget.
        if buf.limit() >= self.header_buffer_size {
            if self.parsing_request_line {
                // Avoid an unknown-protocol error masking this one.
                req.protocol = "HTTP/1.1".to_string();
            }
            return Err(HttpParseError::HeaderTooLarge.into());
        }

        let n = src.read(block, buf.space_after_limit())?;
        if n > 0 {
            buf.advance_limit(n as usize);
            Ok(true)
        } else if n == -1 {
            Err(KilnError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of stream while reading the request",
            )))
        } else {
            Ok(false)
        }
    }

    /// Parse the request line.
    ///
    /// Returns true once complete; false when the thread should be freed:
    /// either more data is needed (phase >= 0) or the HTTP/2 preface was
    /// recognized (phase == -1).
    pub fn parse_request_line(
        &mut self,
        buf: &mut SocketBuffer,
        src: &mut dyn InputSource,
        req: &mut HttpRequest,
        kept_alive: bool,
        connection_timeout_ms: u64,
        keep_alive_timeout_ms: u64,
    ) -> KilnResult<bool> {
        if !self.parsing_request_line {
            return Ok(true);
        }

        // Skip blank lines; watch for the HTTP/2 preface.
        if self.phase < 2 {
            loop {
                if buf.position() >= buf.limit() {
                    if kept_alive {
                        // No request bytes yet: keep-alive timeout applies.
                        src.set_read_timeout_ms(keep_alive_timeout_ms);
                    }
                    if !self.fill(buf, src, req, false)? {
                        // A read is pending, so no longer in initial state.
                        self.phase = 1;
                        return Ok(false);
                    }
                    // First bytes of the request arrived: switch to the
                    // connection timeout.
                    src.set_read_timeout_ms(connection_timeout_ms);
                }
                if !kept_alive && buf.position() == 0 && buf.limit() >= CLIENT_PREFACE.len() {
                    let matched = (0..CLIENT_PREFACE.len()).all(|i| buf.get_at(i) == CLIENT_PREFACE[i]);
                    if matched {
                        self.phase = -1;
                        return Ok(false);
                    }
                }
                if req.start_time.is_none() {
                    req.start_time = Some(std::time::Instant::now());
                }
                self.chr = buf.get();
                if self.chr != CR && self.chr != LF {
                    break;
                }
            }
            buf.set_position(buf.position() - 1);
            self.start_pos = buf.position();
            self.phase = 2;
            trace!(
                received = %tokens::to_printable(buf.slice(buf.position(), buf.limit())),
                "request line bytes"
            );
        }

        // Method token, ended by SP/HT.
        if self.phase == 2 {
            let mut space = false;
            while !space {
                if buf.position() >= buf.limit() {
                    if !self.fill(buf, src, req, false)? {
                        return Ok(false);
                    }
                }
                let pos = buf.position();
                self.chr = buf.get();
                if self.chr == SP || self.chr == HT {
                    space = true;
                    req.method = latin(buf.slice(self.start_pos, pos));
                } else if !tokens::is_token(self.chr) {
                    req.protocol = "HTTP/1.1".to_string();
                    let invalid = self.parse_invalid(buf);
                    return Err(HttpParseError::InvalidMethod(invalid).into());
                }
            }
            self.phase = 3;
        }

        // Tolerate multiple SP/HT between method and target.
        if self.phase == 3 {
            let mut space = true;
            while space {
                if buf.position() >= buf.limit() {
                    if !self.fill(buf, src, req, false)? {
                        return Ok(false);
                    }
                }
                let chr = buf.get();
                if chr != SP && chr != HT {
                    space = false;
                    buf.set_position(buf.position() - 1);
                }
            }
            self.start_pos = buf.position();
            self.phase = 4;
        }

        // Request target; a '?' splits the query string. A bare LF here is
        // an HTTP/0.9 request and skips the protocol field entirely.
        if self.phase == 4 {
            let mut end = 0usize;
            let mut space = false;
            while !space {
                if buf.position() >= buf.limit() {
                    if !self.fill(buf, src, req, false)? {
                        return Ok(false);
                    }
                }
                let pos = buf.position();
                self.prev_chr = self.chr;
                self.chr = buf.get();
                if self.prev_chr == CR && self.chr != LF {
                    // CR not followed by LF: not HTTP/0.9, so invalid.
                    req.protocol = "HTTP/1.1".to_string();
                    let invalid = self.parse_invalid(buf);
                    return Err(HttpParseError::InvalidRequestTarget(invalid).into());
                }
                if self.chr == SP || self.chr == HT {
                    space = true;
                    end = pos;
                } else if self.chr == CR {
                    // HTTP/0.9 style request. CR is optional, LF is not.
                } else if self.chr == LF {
                    space = true;
                    req.protocol = String::new();
                    self.phase = 7;
                    end = if self.prev_chr == CR { pos - 1 } else { pos };
                } else if self.chr == QUESTION && self.q_pos == -1 {
                    self.q_pos = pos as isize;
                } else if self.q_pos != -1 && !self.tokens.is_query(self.chr) {
                    req.protocol = "HTTP/1.1".to_string();
                    let invalid = self.parse_invalid(buf);
                    return Err(HttpParseError::InvalidRequestTarget(invalid).into());
                } else if !self.tokens.is_request_target(self.chr) {
                    req.protocol = "HTTP/1.1".to_string();
                    let invalid = self.parse_invalid(buf);
                    return Err(HttpParseError::InvalidRequestTarget(invalid).into());
                }
            }
            if self.q_pos >= 0 {
                let q = self.q_pos as usize;
                req.query_string = latin(buf.slice(q + 1, end));
                req.uri = latin(buf.slice(self.start_pos, q));
            } else {
                req.uri = latin(buf.slice(self.start_pos, end));
            }
            // HTTP/0.9 jumped to phase 7; don't overwrite that.
            if self.phase == 4 {
                self.phase = 5;
            }
        }

        // Tolerate multiple SP/HT between target and protocol.
        if self.phase == 5 {
            let mut space = true;
            while space {
                if buf.position() >= buf.limit() {
                    if !self.fill(buf, src, req, false)? {
                        return Ok(false);
                    }
                }
                let chr = buf.get();
                if chr != SP && chr != HT {
                    space = false;
                    buf.set_position(buf.position() - 1);
                }
            }
            self.start_pos = buf.position();
            self.phase = 6;
            self.line_end = 0;
        }

        // Protocol token, terminated by CRLF.
        if self.phase == 6 {
            while !self.eol {
                if buf.position() >= buf.limit() {
                    if !self.fill(buf, src, req, false)? {
                        return Ok(false);
                    }
                }
                let pos = buf.position();
                self.prev_chr = self.chr;
                self.chr = buf.get();
                if self.chr == CR {
                    // Possible end of the request line; LF must follow.
                } else if self.prev_chr == CR && self.chr == LF {
                    self.line_end = pos - 1;
                    self.eol = true;
                } else if !tokens::is_http_protocol(self.chr) {
                    let invalid = self.parse_invalid(buf);
                    return Err(HttpParseError::InvalidProtocol(invalid).into());
                }
            }
            if self.line_end > self.start_pos {
                req.protocol = latin(buf.slice(self.start_pos, self.line_end));
                self.phase = 7;
            } else {
                return Err(HttpParseError::InvalidProtocol(String::new()).into());
            }
        }

        if self.phase == 7 {
            self.parsing_request_line = false;
            self.phase = 0;
            self.eol = false;
            self.start_pos = 0;
            return Ok(true);
        }

        Err(KilnError::IllegalState(format!(
            "invalid request line phase {}",
            self.phase
        )))
    }

    /// Parse headers until the blank line. Enforces the cumulative byte
    /// budget: the block must fit `header_buffer_size` and still leave
    /// room for one socket read.
    pub fn parse_headers(
        &mut self,
        buf: &mut SocketBuffer,
        src: &mut dyn InputSource,
        req: &mut HttpRequest,
    ) -> KilnResult<bool> {
        if !self.parsing_header {
            return Err(KilnError::IllegalState(
                "headers are already parsed".to_string(),
            ));
        }

        loop {
            let status = self.parse_header(buf, src, req)?;
            if buf.position() > self.header_buffer_size
                || buf.capacity() - buf.position() < self.socket_read_buffer_size
            {
                return Err(HttpParseError::HeaderTooLarge.into());
            }
            match status {
                HeaderParseStatus::HaveMoreHeaders => continue,
                HeaderParseStatus::Done => {
                    self.parsing_header = false;
                    self.end = buf.position();
                    return Ok(true);
                }
                HeaderParseStatus::NeedMoreData => return Ok(false),
            }
        }
    }

    fn parse_header(
        &mut self,
        buf: &mut SocketBuffer,
        src: &mut dyn InputSource,
        req: &mut HttpRequest,
    ) -> KilnResult<HeaderParseStatus> {
        while self.header_pos == HeaderParsePosition::HeaderStart {
            if buf.position() >= buf.limit() {
                if !self.fill(buf, src, req, false)? {
                    self.header_pos = HeaderParsePosition::HeaderStart;
                    return Ok(HeaderParseStatus::NeedMoreData);
                }
            }

            self.prev_chr = self.chr;
            self.chr = buf.get();

            if self.chr == CR && self.prev_chr != CR {
                // Possible start of CRLF; look at the next byte.
            } else if self.prev_chr == CR && self.chr == LF {
                return Ok(HeaderParseStatus::Done);
            } else {
                if self.prev_chr == CR {
                    // Stray CR then a non-LF byte: step back over both.
                    buf.set_position(buf.position() - 2);
                } else {
                    buf.set_position(buf.position() - 1);
                }
                break;
            }
        }

        if self.header_pos == HeaderParsePosition::HeaderStart {
            self.header_data.start = buf.position();
            self.header_data.line_start = self.header_data.start;
            self.header_pos = HeaderParsePosition::HeaderName;
        }

        // Header name: US-ASCII tokens, lowercased in place, ended by ':'.
        while self.header_pos == HeaderParsePosition::HeaderName {
            if buf.position() >= buf.limit() {
                if !self.fill(buf, src, req, false)? {
                    return Ok(HeaderParseStatus::NeedMoreData);
                }
            }

            let pos = buf.position();
            self.chr = buf.get();
            if self.chr == COLON {
                self.header_pos = HeaderParsePosition::HeaderValueStart;
                let name = latin(buf.slice(self.header_data.start, pos));
                self.header_data.header_index = Some(req.headers.add_name(name));
                let pos = buf.position();
                self.header_data.start = pos;
                self.header_data.real_pos = pos;
                self.header_data.last_significant = pos;
                break;
            } else if !tokens::is_token(self.chr) {
                // Non-token bytes are illegal in names; skip the line so
                // the fault can be reported in context.
                self.header_data.last_significant = pos;
                buf.set_position(buf.position() - 1);
                return self.skip_line(buf, src, req);
            }

            if self.chr.is_ascii_uppercase() {
                buf.put_at(pos, self.chr.to_ascii_lowercase());
            }
        }

        if self.header_pos == HeaderParsePosition::HeaderSkipLine {
            return self.skip_line(buf, src, req);
        }

        // Value, possibly spanning folded continuation lines.
        while matches!(
            self.header_pos,
            HeaderParsePosition::HeaderValueStart
                | HeaderParsePosition::HeaderValue
                | HeaderParsePosition::HeaderMultiLine
        ) {
            if self.header_pos == HeaderParsePosition::HeaderValueStart {
                // Skip leading whitespace.
                loop {
                    if buf.position() >= buf.limit() {
                        if !self.fill(buf, src, req, false)? {
                            return Ok(HeaderParseStatus::NeedMoreData);
                        }
                    }
                    self.chr = buf.get();
                    if self.chr != SP && self.chr != HT {
                        self.header_pos = HeaderParsePosition::HeaderValue;
                        buf.set_position(buf.position() - 1);
                        break;
                    }
                }
            }
            if self.header_pos == HeaderParsePosition::HeaderValue {
                let mut eol = false;
                while !eol {
                    if buf.position() >= buf.limit() {
                        if !self.fill(buf, src, req, false)? {
                            return Ok(HeaderParseStatus::NeedMoreData);
                        }
                    }

                    self.prev_chr = self.chr;
                    self.chr = buf.get();
                    if self.chr == CR {
                        // Possible start of CRLF.
                    } else if self.prev_chr == CR && self.chr == LF {
                        eol = true;
                    } else if self.prev_chr == CR {
                        // Invalid value; drop the half-built header.
                        req.headers.remove_last();
                        self.header_data.header_index = None;
                        return self.skip_line(buf, src, req);
                    } else if self.chr != HT && tokens::is_control(self.chr) {
                        req.headers.remove_last();
                        self.header_data.header_index = None;
                        return self.skip_line(buf, src, req);
                    } else if self.chr == SP || self.chr == HT {
                        buf.put_at(self.header_data.real_pos, self.chr);
                        self.header_data.real_pos += 1;
                    } else {
                        buf.put_at(self.header_data.real_pos, self.chr);
                        self.header_data.real_pos += 1;
                        self.header_data.last_significant = self.header_data.real_pos;
                    }
                }

                // Trailing whitespace is trimmed by rewinding real_pos.
                self.header_data.real_pos = self.header_data.last_significant;
                self.header_pos = HeaderParsePosition::HeaderMultiLine;
            }

            if buf.position() >= buf.limit() {
                if !self.fill(buf, src, req, false)? {
                    return Ok(HeaderParseStatus::NeedMoreData);
                }
            }

            let peek = buf.peek();
            if self.header_pos == HeaderParsePosition::HeaderMultiLine {
                if peek != SP && peek != HT {
                    self.header_pos = HeaderParsePosition::HeaderStart;
                    break;
                } else {
                    // Folded continuation: exactly one space joins lines.
                    buf.put_at(self.header_data.real_pos, peek);
                    self.header_data.real_pos += 1;
                    self.header_pos = HeaderParsePosition::HeaderValueStart;
                }
            }
        }

        if let Some(index) = self.header_data.header_index.take() {
            let value = latin(buf.slice(self.header_data.start, self.header_data.last_significant));
            req.headers.set_value(index, value);
        }
        self.header_data.recycle();
        Ok(HeaderParseStatus::HaveMoreHeaders)
    }

    fn skip_line(
        &mut self,
        buf: &mut SocketBuffer,
        src: &mut dyn InputSource,
        req: &mut HttpRequest,
    ) -> KilnResult<HeaderParseStatus> {
        self.header_pos = HeaderParsePosition::HeaderSkipLine;
        let mut eol = false;
        while !eol {
            if buf.position() >= buf.limit() {
                if !self.fill(buf, src, req, false)? {
                    return Ok(HeaderParseStatus::NeedMoreData);
                }
            }

            let pos = buf.position();
            self.prev_chr = self.chr;
            self.chr = buf.get();
            if self.chr == CR {
                // Skip.
            } else if self.prev_chr == CR && self.chr == LF {
                eol = true;
            } else {
                self.header_data.last_significant = pos;
            }
        }

        let line = tokens::to_printable(
            buf.slice(self.header_data.line_start, self.header_data.last_significant + 1),
        );
        if self.reject_illegal_header {
            return Err(HttpParseError::InvalidHeader(line).into());
        }
        debug!(header = %line, "ignoring invalid header line");

        self.header_pos = HeaderParsePosition::HeaderStart;
        Ok(HeaderParseStatus::HaveMoreHeaders)
    }

    /// Render the offending bytes up to the next space for an error.
    fn parse_invalid(&self, buf: &mut SocketBuffer) -> String {
        let start = self.start_pos;
        let mut b = 0u8;
        while buf.has_remaining() && b != 0x20 {
            b = buf.get();
        }
        let end = buf.position().saturating_sub(1).max(start);
        let mut result = tokens::to_printable(buf.slice(start, end));
        if b != 0x20 {
            result.push_str("...");
        }
        result
    }

    // ---- Body access through the filter chain ----

    /// Read a slice of request body, routed through the last active
    /// filter.
    pub fn do_read(
        &mut self,
        buf: &mut SocketBuffer,
        src: &mut dyn InputSource,
    ) -> KilnResult<super::filters::BodyChunk> {
        let mut input = SocketInput {
            buf: &mut *buf,
            src,
            end: self.end,
        };
        self.filters.do_read(&mut input)
    }

    /// Consume leftover body bytes so the connection can be reused. Any
    /// surplus bytes a filter read past the body end are pushed back.
    pub fn end_request(
        &mut self,
        buf: &mut SocketBuffer,
        src: &mut dyn InputSource,
    ) -> KilnResult<()> {
        if self.swallow_input && self.filters.has_active() {
            let extra = {
                let mut input = SocketInput {
                    buf: &mut *buf,
                    src,
                    end: self.end,
                };
                self.filters.end(&mut input)?
            };
            let pos = buf.position();
            buf.set_position(pos - extra);
        }
        Ok(())
    }

    /// Bytes immediately available without a socket read.
    pub fn available(&self, buf: &SocketBuffer) -> usize {
        let direct = buf.remaining();
        if direct > 0 {
            return direct;
        }
        self.filters.available()
    }
}

fn latin(bytes: &[u8]) -> String {
    // Request bytes are ASCII at this point; lossy covers the rest.
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds a fixed byte script, `chunk` bytes per read call.
    pub struct ScriptedSource {
        data: Vec<u8>,
        offset: usize,
        chunk: usize,
    }

    impl ScriptedSource {
        pub fn new(data: &[u8], chunk: usize) -> Self {
            Self {
                data: data.to_vec(),
                offset: 0,
                chunk,
            }
        }
    }

    impl InputSource for ScriptedSource {
        fn read(&mut self, _block: bool, dst: &mut [u8]) -> KilnResult<isize> {
            if self.offset >= self.data.len() {
                return Ok(0);
            }
            let n = self.chunk.min(dst.len()).min(self.data.len() - self.offset);
            dst[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
            self.offset += n;
            Ok(n as isize)
        }
    }

    fn parser() -> HttpInputBuffer {
        HttpInputBuffer::new(8192, 8192, false, Arc::new(HttpTokens::default()))
    }

    fn buffer() -> SocketBuffer {
        SocketBuffer::with_capacity(8192 + 8192)
    }

    #[test]
    fn one_shot_request_line() {
        let mut p = parser();
        let mut buf = buffer();
        let mut req = HttpRequest::new();
        let mut src = ScriptedSource::new(b"GET /x?a=b HTTP/1.1\r\n", 1024);
        assert!(p
            .parse_request_line(&mut buf, &mut src, &mut req, false, 20_000, 20_000)
            .unwrap());
        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, "/x");
        assert_eq!(req.query_string, "a=b");
        assert_eq!(req.protocol, "HTTP/1.1");
    }

    #[test]
    fn request_line_resumes_across_single_byte_reads() {
        let mut p = parser();
        let mut buf = buffer();
        let mut req = HttpRequest::new();
        let mut src = ScriptedSource::new(b"POST /submit HTTP/1.0\r\n", 1);
        let mut done = false;
        for _ in 0..200 {
            if p.parse_request_line(&mut buf, &mut src, &mut req, false, 20_000, 20_000)
                .unwrap()
            {
                done = true;
                break;
            }
        }
        assert!(done);
        assert_eq!(req.method, "POST");
        assert_eq!(req.uri, "/submit");
        assert_eq!(req.protocol, "HTTP/1.0");
    }

    #[test]
    fn preface_parks_parser_in_phase_minus_one() {
        let mut p = parser();
        let mut buf = buffer();
        let mut req = HttpRequest::new();
        let mut src = ScriptedSource::new(CLIENT_PREFACE, 1024);
        let done = p
            .parse_request_line(&mut buf, &mut src, &mut req, false, 20_000, 20_000)
            .unwrap();
        assert!(!done);
        assert_eq!(p.parsing_phase(), -1);
    }

    #[test]
    fn kept_alive_connections_never_match_the_preface() {
        let mut p = parser();
        let mut buf = buffer();
        let mut req = HttpRequest::new();
        let mut src = ScriptedSource::new(CLIENT_PREFACE, 1024);
        // kept_alive = true: the bytes parse (and fail) as HTTP instead.
        let result = p.parse_request_line(&mut buf, &mut src, &mut req, true, 20_000, 20_000);
        assert!(p.parsing_phase() != -1);
        // "PRI * HTTP/2.0" parses as method/target/protocol; the parse
        // eventually stalls or errors, but never signals an upgrade.
        let _ = result;
    }
}
