//! Body input filter behavior: identity (content-length), chunked
//! decoding, and the void filter.

use kiln::endpoint::buffer::SocketBuffer;
use kiln::error::{HttpParseError, KilnError, KilnResult};
use kiln::http::filters::{
    BodyChunk, ChunkedInputFilter, FilterChain, IdentityInputFilter, SocketInput, VoidInputFilter,
};
use kiln::http::input_buffer::InputSource;

struct ScriptedSource {
    data: Vec<u8>,
    offset: usize,
    chunk: usize,
}

impl ScriptedSource {
    fn new(data: &[u8], chunk: usize) -> Self {
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

/// Drain a chain into a Vec until End (or a stall).
fn read_all(chain: &mut FilterChain, buf: &mut SocketBuffer, src: &mut ScriptedSource) -> Vec<u8> {
    let mut out = Vec::new();
    for _ in 0..100_000 {
        let mut input = SocketInput {
            buf: &mut *buf,
            src: &mut *src,
            end: 0,
        };
        match chain.do_read(&mut input).unwrap() {
            BodyChunk::Data(start, end) => out.extend_from_slice(buf.slice(start, end)),
            BodyChunk::End => return out,
            BodyChunk::NeedMoreData => {
                if src.offset >= src.data.len() {
                    panic!("filter stalled");
                }
            }
        }
    }
    out
}

#[test]
fn identity_reads_exactly_content_length() {
    let mut chain = FilterChain::new();
    chain.add_active(Box::new(IdentityInputFilter::new(5)));
    let mut buf = SocketBuffer::with_capacity(1024);
    let mut src = ScriptedSource::new(b"helloEXTRA", 1024);
    let body = read_all(&mut chain, &mut buf, &mut src);
    assert_eq!(body, b"hello");
    // Surplus bytes stay buffered for the next request.
    assert_eq!(buf.remaining(), 5);
    assert_eq!(buf.slice(buf.position(), buf.limit()), b"EXTRA");
    assert!(chain.is_finished());
}

#[test]
fn identity_assembles_split_reads() {
    let mut chain = FilterChain::new();
    chain.add_active(Box::new(IdentityInputFilter::new(8)));
    let mut buf = SocketBuffer::with_capacity(1024);
    let mut src = ScriptedSource::new(b"abcdefgh", 3);
    let body = read_all(&mut chain, &mut buf, &mut src);
    assert_eq!(body, b"abcdefgh");
}

#[test]
fn chunked_decodes_multiple_chunks() {
    let mut chain = FilterChain::new();
    chain.add_active(Box::new(ChunkedInputFilter::new()));
    let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let mut buf = SocketBuffer::with_capacity(1024);
    let mut src = ScriptedSource::new(raw, 1024);
    let body = read_all(&mut chain, &mut buf, &mut src);
    assert_eq!(body, b"hello world");
    assert!(chain.is_finished());
}

#[test]
fn chunked_decodes_byte_at_a_time() {
    let mut chain = FilterChain::new();
    chain.add_active(Box::new(ChunkedInputFilter::new()));
    let raw = b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let mut buf = SocketBuffer::with_capacity(1024);
    let mut src = ScriptedSource::new(raw, 1);
    let body = read_all(&mut chain, &mut buf, &mut src);
    assert_eq!(body, b"wikipedia");
}

#[test]
fn chunked_ignores_extensions_and_trailers() {
    let mut chain = FilterChain::new();
    chain.add_active(Box::new(ChunkedInputFilter::new()));
    let raw = b"3;name=value\r\nabc\r\n0\r\nTrailer: ignored\r\n\r\n";
    let mut buf = SocketBuffer::with_capacity(1024);
    let mut src = ScriptedSource::new(raw, 1024);
    let body = read_all(&mut chain, &mut buf, &mut src);
    assert_eq!(body, b"abc");
    assert!(chain.is_finished());
}

#[test]
fn chunked_rejects_bad_size_line() {
    let mut chain = FilterChain::new();
    chain.add_active(Box::new(ChunkedInputFilter::new()));
    let raw = b"zz\r\nabc\r\n0\r\n\r\n";
    let mut buf = SocketBuffer::with_capacity(1024);
    let mut src = ScriptedSource::new(raw, 1024);
    let mut input = SocketInput {
        buf: &mut buf,
        src: &mut src,
        end: 0,
    };
    let result = chain.do_read(&mut input);
    assert!(matches!(
        result,
        Err(KilnError::Parse(HttpParseError::InvalidChunk))
    ));
}

#[test]
fn void_filter_reports_immediate_end() {
    let mut chain = FilterChain::new();
    chain.add_active(Box::new(VoidInputFilter));
    let mut buf = SocketBuffer::with_capacity(64);
    let mut src = ScriptedSource::new(b"ignored", 64);
    let body = read_all(&mut chain, &mut buf, &mut src);
    assert!(body.is_empty());
    assert!(chain.is_finished());
}

#[test]
fn identity_end_swallows_unread_body() {
    let mut chain = FilterChain::new();
    chain.add_active(Box::new(IdentityInputFilter::new(6)));
    let mut buf = SocketBuffer::with_capacity(1024);
    let mut src = ScriptedSource::new(b"sixbytNEXT", 1024);
    let mut input = SocketInput {
        buf: &mut buf,
        src: &mut src,
        end: 0,
    };
    let extra = chain.end(&mut input).unwrap();
    assert_eq!(extra, 0);
    assert!(chain.is_finished());
    // The pipelined tail is untouched.
    assert_eq!(buf.slice(buf.position(), buf.limit()), b"NEXT");
}

#[test]
fn chain_recycle_clears_active_filters() {
    let mut chain = FilterChain::new();
    chain.add_active(Box::new(VoidInputFilter));
    assert!(chain.has_active());
    assert_eq!(chain.last_active(), 0);
    chain.recycle();
    assert!(!chain.has_active());
    assert_eq!(chain.last_active(), -1);
}
