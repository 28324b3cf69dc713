//! Request-body input filters: identity (content-length bounded), chunked
//! transfer decoding, and the void filter for bodyless requests. The last
//! active filter is the one callers read from.

use crate::endpoint::buffer::SocketBuffer;
use crate::error::{HttpParseError, KilnError, KilnResult};

use super::input_buffer::InputSource;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Result of a body read. Data ranges index into the shared parse buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyChunk {
    Data(usize, usize),
    NeedMoreData,
    End,
}

/// Borrowed view the filters read through: the shared buffer, the socket
/// source, and the body-start watermark for refills.
pub struct SocketInput<'a> {
    pub buf: &'a mut SocketBuffer,
    pub src: &'a mut dyn InputSource,
    pub end: usize,
}

enum RawRead {
    Data(usize, usize),
    None,
}

impl SocketInput<'_> {
    /// Hand out everything currently buffered, filling first if empty.
    fn read_raw(&mut self, block: bool) -> KilnResult<RawRead> {
        if self.buf.position() >= self.buf.limit() {
            if !self.fill(block)? {
                return Ok(RawRead::None);
            }
        }
        let start = self.buf.position();
        let end = self.buf.limit();
        self.buf.set_position(end);
        Ok(RawRead::Data(start, end))
    }

    /// One byte, filling if needed. None when a non-blocking read stalls.
    fn read_byte(&mut self, block: bool) -> KilnResult<Option<u8>> {
        if self.buf.position() >= self.buf.limit() {
            if !self.fill(block)? {
                return Ok(None);
            }
        }
        Ok(Some(self.buf.get()))
    }

    /// Body fill: consumed body bytes are discarded by rewinding to the
    /// end-of-header watermark before appending.
    fn fill(&mut self, block: bool) -> KilnResult<bool> {
        debug_assert!(self.buf.position() >= self.buf.limit());
        self.buf.set_limit(self.end);
        self.buf.set_position(self.end);
        let n = self.src.read(block, self.buf.space_after_limit())?;
        if n > 0 {
            self.buf.advance_limit(n as usize);
            Ok(true)
        } else if n == -1 {
            Err(KilnError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of stream while reading the request body",
            )))
        } else {
            Ok(false)
        }
    }
}

pub trait InputFilter: Send {
    fn do_read(&mut self, input: &mut SocketInput) -> KilnResult<BodyChunk>;

    /// Swallow whatever remains of the body; returns surplus bytes that
    /// were read past the body end and must be pushed back.
    fn end(&mut self, input: &mut SocketInput) -> KilnResult<usize>;

    fn available(&self) -> usize {
        0
    }

    fn is_finished(&self) -> bool;

    fn recycle(&mut self);
}

/// Content-length delimited body.
pub struct IdentityInputFilter {
    remaining: i64,
}

impl IdentityInputFilter {
    pub fn new(content_length: i64) -> Self {
        Self {
            remaining: content_length,
        }
    }
}

impl InputFilter for IdentityInputFilter {
    fn do_read(&mut self, input: &mut SocketInput) -> KilnResult<BodyChunk> {
        if self.remaining <= 0 {
            return Ok(BodyChunk::End);
        }
        match input.read_raw(true)? {
            RawRead::None => Ok(BodyChunk::NeedMoreData),
            RawRead::Data(start, end) => {
                let n = (end - start) as i64;
                if n > self.remaining {
                    // Surplus belongs to the next request; push it back.
                    let take = self.remaining as usize;
                    input.buf.set_position(start + take);
                    self.remaining = 0;
                    Ok(BodyChunk::Data(start, start + take))
                } else {
                    self.remaining -= n;
                    Ok(BodyChunk::Data(start, end))
                }
            }
        }
    }

    fn end(&mut self, input: &mut SocketInput) -> KilnResult<usize> {
        while self.remaining > 0 {
            match self.do_read(input)? {
                BodyChunk::Data(_, _) => {}
                BodyChunk::NeedMoreData | BodyChunk::End => break,
            }
        }
        Ok(0)
    }

    fn is_finished(&self) -> bool {
        self.remaining <= 0
    }

    fn recycle(&mut self) {
        self.remaining = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Reading the chunk-size line (hex size, optional extension, CRLF).
    Header,
    /// Inside chunk data.
    Data,
    /// CRLF after chunk data.
    DataCrlf,
    /// After the zero-size chunk: trailer lines until the empty line.
    TrailerStart,
    /// Consuming one trailer line.
    Trailer,
    End,
}

/// Chunked transfer-encoding decoder.
pub struct ChunkedInputFilter {
    state: ChunkState,
    chunk_remaining: usize,
    /// Scratch for the size line: value and whether any digit was seen.
    size: usize,
    size_digits: usize,
    in_extension: bool,
    saw_cr: bool,
}

impl ChunkedInputFilter {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Header,
            chunk_remaining: 0,
            size: 0,
            size_digits: 0,
            in_extension: false,
            saw_cr: false,
        }
    }

    fn parse_size_byte(&mut self, b: u8) -> KilnResult<bool> {
        // Returns true when the size line is complete.
        if self.saw_cr {
            if b != LF {
                return Err(HttpParseError::InvalidChunk.into());
            }
            if self.size_digits == 0 {
                return Err(HttpParseError::InvalidChunk.into());
            }
            return Ok(true);
        }
        if b == CR {
            self.saw_cr = true;
            return Ok(false);
        }
        if b == b';' {
            self.in_extension = true;
            return Ok(false);
        }
        if self.in_extension {
            return Ok(false);
        }
        let digit = match b {
            b'0'..=b'9' => (b - b'0') as usize,
            b'a'..=b'f' => (b - b'a' + 10) as usize,
            b'A'..=b'F' => (b - b'A' + 10) as usize,
            _ => return Err(HttpParseError::InvalidChunk.into()),
        };
        // Reject absurd sizes before they overflow.
        if self.size > usize::MAX >> 8 {
            return Err(HttpParseError::InvalidChunk.into());
        }
        self.size = (self.size << 4) | digit;
        self.size_digits += 1;
        Ok(false)
    }
}

impl Default for ChunkedInputFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl InputFilter for ChunkedInputFilter {
    fn do_read(&mut self, input: &mut SocketInput) -> KilnResult<BodyChunk> {
        loop {
            match self.state {
                ChunkState::End => return Ok(BodyChunk::End),
                ChunkState::Header => {
                    let Some(b) = input.read_byte(true)? else {
                        return Ok(BodyChunk::NeedMoreData);
                    };
                    if self.parse_size_byte(b)? {
                        let size = self.size;
                        self.size = 0;
                        self.size_digits = 0;
                        self.in_extension = false;
                        self.saw_cr = false;
                        if size == 0 {
                            self.state = ChunkState::TrailerStart;
                        } else {
                            self.chunk_remaining = size;
                            self.state = ChunkState::Data;
                        }
                    }
                }
                ChunkState::Data => {
                    match input.read_raw(true)? {
                        RawRead::None => return Ok(BodyChunk::NeedMoreData),
                        RawRead::Data(start, end) => {
                            let available = end - start;
                            let take = available.min(self.chunk_remaining);
                            if take < available {
                                input.buf.set_position(start + take);
                            }
                            self.chunk_remaining -= take;
                            if self.chunk_remaining == 0 {
                                self.state = ChunkState::DataCrlf;
                            }
                            return Ok(BodyChunk::Data(start, start + take));
                        }
                    }
                }
                ChunkState::DataCrlf => {
                    let Some(b) = input.read_byte(true)? else {
                        return Ok(BodyChunk::NeedMoreData);
                    };
                    if self.saw_cr {
                        if b != LF {
                            return Err(HttpParseError::InvalidChunk.into());
                        }
                        self.saw_cr = false;
                        self.state = ChunkState::Header;
                    } else if b == CR {
                        self.saw_cr = true;
                    } else {
                        return Err(HttpParseError::InvalidChunk.into());
                    }
                }
                ChunkState::TrailerStart => {
                    let Some(b) = input.read_byte(true)? else {
                        return Ok(BodyChunk::NeedMoreData);
                    };
                    if self.saw_cr {
                        if b != LF {
                            return Err(HttpParseError::InvalidChunk.into());
                        }
                        self.saw_cr = false;
                        self.state = ChunkState::End;
                    } else if b == CR {
                        self.saw_cr = true;
                    } else {
                        // A trailer header line; ignored through its CRLF.
                        self.state = ChunkState::Trailer;
                    }
                }
                ChunkState::Trailer => {
                    let Some(b) = input.read_byte(true)? else {
                        return Ok(BodyChunk::NeedMoreData);
                    };
                    if self.saw_cr {
                        if b != LF {
                            return Err(HttpParseError::InvalidChunk.into());
                        }
                        self.saw_cr = false;
                        self.state = ChunkState::TrailerStart;
                    } else if b == CR {
                        self.saw_cr = true;
                    }
                }
            }
        }
    }

    fn end(&mut self, input: &mut SocketInput) -> KilnResult<usize> {
        while self.state != ChunkState::End {
            match self.do_read(input)? {
                BodyChunk::Data(_, _) => {}
                BodyChunk::NeedMoreData => break,
                BodyChunk::End => break,
            }
        }
        Ok(0)
    }

    fn is_finished(&self) -> bool {
        self.state == ChunkState::End
    }

    fn recycle(&mut self) {
        *self = ChunkedInputFilter::new();
    }
}

/// Filter for requests that must not carry a body.
pub struct VoidInputFilter;

impl InputFilter for VoidInputFilter {
    fn do_read(&mut self, _input: &mut SocketInput) -> KilnResult<BodyChunk> {
        Ok(BodyChunk::End)
    }

    fn end(&mut self, _input: &mut SocketInput) -> KilnResult<usize> {
        Ok(0)
    }

    fn is_finished(&self) -> bool {
        true
    }

    fn recycle(&mut self) {}
}

/// Ordered set of active filters. Callers read from the last one; the
/// chain is torn down between requests.
pub struct FilterChain {
    active: Vec<Box<dyn InputFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self { active: Vec::new() }
    }

    pub fn add_active(&mut self, filter: Box<dyn InputFilter>) {
        self.active.push(filter);
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn last_active(&self) -> isize {
        self.active.len() as isize - 1
    }

    pub fn do_read(&mut self, input: &mut SocketInput) -> KilnResult<BodyChunk> {
        match self.active.last_mut() {
            None => match input.read_raw(true)? {
                RawRead::None => Ok(BodyChunk::NeedMoreData),
                RawRead::Data(start, end) => Ok(BodyChunk::Data(start, end)),
            },
            Some(filter) => filter.do_read(input),
        }
    }

    pub fn end(&mut self, input: &mut SocketInput) -> KilnResult<usize> {
        match self.active.last_mut() {
            None => Ok(0),
            Some(filter) => filter.end(input),
        }
    }

    pub fn available(&self) -> usize {
        self.active.iter().map(|f| f.available()).sum()
    }

    pub fn is_finished(&self) -> bool {
        self.active.last().map(|f| f.is_finished()).unwrap_or(false)
    }

    pub fn recycle(&mut self) {
        self.active.clear();
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}
