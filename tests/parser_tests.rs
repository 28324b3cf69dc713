//! Request-line and header parser behavior, including resumability and
//! the header byte budget.

use std::sync::Arc;

use kiln::endpoint::buffer::SocketBuffer;
use kiln::error::{HttpParseError, KilnError, KilnResult};
use kiln::http::input_buffer::{HttpInputBuffer, InputSource, CLIENT_PREFACE};
use kiln::http::request::HttpRequest;
use kiln::http::tokens::HttpTokens;

const HEADER_BUDGET: usize = 8192;
const READ_BUF: usize = 8192;

/// Feeds a fixed byte script, `chunk` bytes per read call, recording the
/// read-timeout switches the parser performs.
struct ScriptedSource {
    data: Vec<u8>,
    offset: usize,
    chunk: usize,
    timeouts_set: Vec<u64>,
}

impl ScriptedSource {
    fn new(data: &[u8], chunk: usize) -> Self {
        Self {
            data: data.to_vec(),
            offset: 0,
            chunk,
            timeouts_set: Vec::new(),
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

    fn set_read_timeout_ms(&mut self, timeout_ms: u64) {
        self.timeouts_set.push(timeout_ms);
    }
}

fn parser() -> HttpInputBuffer {
    HttpInputBuffer::new(HEADER_BUDGET, READ_BUF, false, Arc::new(HttpTokens::default()))
}

fn strict_parser() -> HttpInputBuffer {
    HttpInputBuffer::new(HEADER_BUDGET, READ_BUF, true, Arc::new(HttpTokens::default()))
}

fn buffer() -> SocketBuffer {
    SocketBuffer::with_capacity(HEADER_BUDGET + READ_BUF)
}

/// Parse a complete request (line + headers), driving the parser until it
/// finishes or errors.
fn parse_full(
    p: &mut HttpInputBuffer,
    buf: &mut SocketBuffer,
    src: &mut ScriptedSource,
    req: &mut HttpRequest,
) -> KilnResult<bool> {
    for _ in 0..100_000 {
        if p.parse_request_line(buf, src, req, false, 20_000, 20_000)? {
            break;
        }
        if p.parsing_phase() == -1 {
            return Ok(false);
        }
        if src.offset >= src.data.len() {
            panic!("parser stalled on request line");
        }
    }
    if req.protocol.is_empty() {
        return Ok(true);
    }
    for _ in 0..100_000 {
        if p.parse_headers(buf, src, req)? {
            return Ok(true);
        }
        if src.offset >= src.data.len() {
            panic!("parser stalled on headers");
        }
    }
    unreachable!()
}

#[test]
fn simple_get_parses_completely() {
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n", 4096);
    assert!(parse_full(&mut p, &mut buf, &mut src, &mut req).unwrap());
    assert_eq!(req.method, "GET");
    assert_eq!(req.uri, "/x");
    assert_eq!(req.query_string, "");
    assert_eq!(req.protocol, "HTTP/1.1");
    assert_eq!(req.headers.get("host"), Some("a"));
    assert_eq!(req.headers.len(), 1);
}

#[test]
fn http09_request_has_empty_protocol() {
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(b"GET /y\n", 4096);
    assert!(p
        .parse_request_line(&mut buf, &mut src, &mut req, false, 20_000, 20_000)
        .unwrap());
    assert_eq!(req.method, "GET");
    assert_eq!(req.uri, "/y");
    assert_eq!(req.protocol, "");
    assert!(req.is_http09());
}

#[test]
fn http2_preface_returns_false_with_phase_minus_one() {
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(CLIENT_PREFACE, 4096);
    let done = p
        .parse_request_line(&mut buf, &mut src, &mut req, false, 20_000, 20_000)
        .unwrap();
    assert!(!done);
    assert_eq!(p.parsing_phase(), -1);
}

#[test]
fn folded_header_joins_lines_with_one_space() {
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(b"GET / HTTP/1.1\r\nX-Multi: a\r\n b\r\n\r\n", 4096);
    assert!(parse_full(&mut p, &mut buf, &mut src, &mut req).unwrap());
    assert_eq!(req.headers.get("x-multi"), Some("a b"));
}

#[test]
fn folded_header_equals_single_line_form() {
    let mut p1 = parser();
    let mut buf1 = buffer();
    let mut req1 = HttpRequest::new();
    let mut src1 = ScriptedSource::new(b"GET / HTTP/1.1\r\nName: V1 V2\r\n\r\n", 4096);
    parse_full(&mut p1, &mut buf1, &mut src1, &mut req1).unwrap();

    let mut p2 = parser();
    let mut buf2 = buffer();
    let mut req2 = HttpRequest::new();
    let mut src2 = ScriptedSource::new(b"GET / HTTP/1.1\r\nName: V1\r\n  V2\r\n\r\n", 4096);
    parse_full(&mut p2, &mut buf2, &mut src2, &mut req2).unwrap();

    assert_eq!(req1.headers.get("name"), Some("V1 V2"));
    assert_eq!(req2.headers.get("name"), Some("V1 V2"));
}

#[test]
fn byte_at_a_time_equals_one_shot() {
    let raw: &[u8] = b"POST /items/7?q=x&y=z HTTP/1.1\r\nHost: shop.example\r\nContent-Length: 0\r\nX-Trace: abc def\r\n\r\n";

    let mut p1 = parser();
    let mut buf1 = buffer();
    let mut req1 = HttpRequest::new();
    let mut src1 = ScriptedSource::new(raw, raw.len());
    parse_full(&mut p1, &mut buf1, &mut src1, &mut req1).unwrap();

    let mut p2 = parser();
    let mut buf2 = buffer();
    let mut req2 = HttpRequest::new();
    let mut src2 = ScriptedSource::new(raw, 1);
    parse_full(&mut p2, &mut buf2, &mut src2, &mut req2).unwrap();

    assert_eq!(req1.method, req2.method);
    assert_eq!(req1.uri, req2.uri);
    assert_eq!(req1.query_string, req2.query_string);
    assert_eq!(req1.protocol, req2.protocol);
    assert_eq!(req1.headers.len(), req2.headers.len());
    for (a, b) in req1.headers.iter().zip(req2.headers.iter()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.value, b.value);
    }
}

fn padded_request(total: usize) -> Vec<u8> {
    let fixed = b"GET / HTTP/1.1\r\nhost: a\r\nx-pad: ".len() + b"\r\n\r\n".len();
    let padding = total - fixed;
    let mut raw = Vec::new();
    raw.extend_from_slice(b"GET / HTTP/1.1\r\nhost: a\r\nx-pad: ");
    raw.extend(std::iter::repeat(b'p').take(padding));
    raw.extend_from_slice(b"\r\n\r\n");
    assert_eq!(raw.len(), total);
    raw
}

#[test]
fn header_block_of_exactly_the_budget_parses() {
    let raw = padded_request(HEADER_BUDGET);
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(&raw, 4096);
    assert!(parse_full(&mut p, &mut buf, &mut src, &mut req).unwrap());
    assert_eq!(req.headers.len(), 2);
}

#[test]
fn header_block_one_byte_over_budget_fails() {
    let raw = padded_request(HEADER_BUDGET + 1);
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(&raw, 4096);
    let result = parse_full(&mut p, &mut buf, &mut src, &mut req);
    assert!(matches!(
        result,
        Err(KilnError::Parse(HttpParseError::HeaderTooLarge))
    ));
}

#[test]
fn unterminated_oversized_headers_fail() {
    let mut raw = b"GET / HTTP/1.1\r\nx-run: ".to_vec();
    raw.extend(std::iter::repeat(b'r').take(HEADER_BUDGET));
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(&raw, 4096);
    let result = parse_full(&mut p, &mut buf, &mut src, &mut req);
    assert!(matches!(
        result,
        Err(KilnError::Parse(HttpParseError::HeaderTooLarge))
    ));
}

#[test]
fn cr_without_lf_in_request_target_fails() {
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(b"GET /x\rq HTTP/1.1\r\n\r\n", 4096);
    let result = parse_full(&mut p, &mut buf, &mut src, &mut req);
    assert!(matches!(
        result,
        Err(KilnError::Parse(HttpParseError::InvalidRequestTarget(_)))
    ));
}

#[test]
fn invalid_method_byte_fails() {
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(b"GE(T / HTTP/1.1\r\n\r\n", 4096);
    let result = parse_full(&mut p, &mut buf, &mut src, &mut req);
    assert!(matches!(
        result,
        Err(KilnError::Parse(HttpParseError::InvalidMethod(_)))
    ));
}

#[test]
fn invalid_protocol_byte_fails() {
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(b"GET / HTZP/1.1\r\n\r\n", 4096);
    let result = parse_full(&mut p, &mut buf, &mut src, &mut req);
    assert!(matches!(
        result,
        Err(KilnError::Parse(HttpParseError::InvalidProtocol(_)))
    ));
}

#[test]
fn stray_cr_line_is_skipped_when_lenient() {
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(b"GET / HTTP/1.1\r\nA: b\r\n\rX: c\r\n\r\n", 4096);
    assert!(parse_full(&mut p, &mut buf, &mut src, &mut req).unwrap());
    // The malformed "\rX: c" line is ignored; the valid header survives.
    assert_eq!(req.headers.get("a"), Some("b"));
    assert_eq!(req.headers.len(), 1);
}

#[test]
fn stray_cr_line_is_rejected_when_strict() {
    let mut p = strict_parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(b"GET / HTTP/1.1\r\nA: b\r\n\rX: c\r\n\r\n", 4096);
    let result = parse_full(&mut p, &mut buf, &mut src, &mut req);
    assert!(matches!(
        result,
        Err(KilnError::Parse(HttpParseError::InvalidHeader(_)))
    ));
}

#[test]
fn header_names_are_lowercased() {
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(b"GET / HTTP/1.1\r\nX-UPPER-Case: V\r\n\r\n", 4096);
    parse_full(&mut p, &mut buf, &mut src, &mut req).unwrap();
    let field = req.headers.iter().next().unwrap();
    assert_eq!(field.name, "x-upper-case");
    // Values keep their case.
    assert_eq!(field.value, "V");
}

#[test]
fn keep_alive_timeout_switches_to_connection_timeout_on_first_byte() {
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", 4096);
    // kept_alive: the parser should arm the keep-alive timeout while the
    // buffer is empty, then switch once bytes arrive.
    for _ in 0..100 {
        if p.parse_request_line(&mut buf, &mut src, &mut req, true, 20_000, 5_000)
            .unwrap()
        {
            break;
        }
    }
    assert_eq!(src.timeouts_set.first(), Some(&5_000));
    assert!(src.timeouts_set.contains(&20_000));
}

#[test]
fn next_request_preserves_pipelined_bytes() {
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let raw = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
    let mut src = ScriptedSource::new(raw, raw.len());
    assert!(parse_full(&mut p, &mut buf, &mut src, &mut req).unwrap());
    assert_eq!(req.uri, "/a");

    p.next_request(&mut buf);
    req.recycle();
    assert!(parse_full(&mut p, &mut buf, &mut src, &mut req).unwrap());
    assert_eq!(req.uri, "/b");
}

#[test]
fn multiple_spaces_between_tokens_are_tolerated() {
    let mut p = parser();
    let mut buf = buffer();
    let mut req = HttpRequest::new();
    let mut src = ScriptedSource::new(b"GET   /x \t HTTP/1.1\r\n\r\n", 4096);
    assert!(parse_full(&mut p, &mut buf, &mut src, &mut req).unwrap());
    assert_eq!(req.method, "GET");
    assert_eq!(req.uri, "/x");
    assert_eq!(req.protocol, "HTTP/1.1");
}
