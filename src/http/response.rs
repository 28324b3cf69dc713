use std::sync::Arc;

use crate::endpoint::socket::SocketWrapper;
use crate::error::{KilnError, KilnResult};

/// A sendfile intent recorded by the application; the endpoint turns it
/// into a zero-copy transfer once the headers are on the wire.
#[derive(Debug, Clone)]
pub struct SendfileRequest {
    pub path: String,
    pub pos: u64,
    pub length: u64,
}

/// Response under construction. Bodies are buffered; large static files
/// go through the sendfile path instead.
#[derive(Debug, Default)]
pub struct HttpResponse {
    pub status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    committed: bool,
    sendfile: Option<SendfileRequest>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            status: 200,
            ..Default::default()
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(existing) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            existing.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Flag the response as committed. Committing twice is a pipeline
    /// state-machine violation.
    pub fn commit(&mut self) -> KilnResult<()> {
        if self.committed {
            return Err(KilnError::IllegalState(
                "response is already committed".to_string(),
            ));
        }
        self.committed = true;
        Ok(())
    }

    /// Serve a file through the endpoint's zero-copy path.
    pub fn sendfile(&mut self, path: &str, pos: u64, length: u64) {
        self.sendfile = Some(SendfileRequest {
            path: path.to_string(),
            pos,
            length,
        });
    }

    pub fn take_sendfile(&mut self) -> Option<SendfileRequest> {
        self.sendfile.take()
    }

    pub fn has_sendfile(&self) -> bool {
        self.sendfile.is_some()
    }

    pub fn recycle(&mut self) {
        self.status = 200;
        self.headers.clear();
        self.body.clear();
        self.committed = false;
        self.sendfile = None;
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

/// Send the 100-continue interim response.
pub fn write_continue(wrapper: &Arc<SocketWrapper>) -> KilnResult<()> {
    wrapper.write(true, b"HTTP/1.1 100 Continue\r\n\r\n")?;
    Ok(())
}

/// Serialize and send a response through the wrapper's write buffer.
/// HTTP/0.9 peers get the bare body. Returns bytes put on the wire.
pub fn write_response(
    wrapper: &Arc<SocketWrapper>,
    response: &mut HttpResponse,
    keep_alive: bool,
    http09: bool,
    head_request: bool,
) -> KilnResult<usize> {
    response.commit()?;

    if http09 {
        let n = wrapper.write(true, &response.body)?;
        return Ok(n);
    }

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 ");
    head.extend_from_slice(response.status.to_string().as_bytes());
    head.push(b' ');
    head.extend_from_slice(reason_phrase(response.status).as_bytes());
    head.extend_from_slice(b"\r\n");

    let content_length = match &response.sendfile {
        Some(sf) => sf.length,
        None => response.body.len() as u64,
    };
    head.extend_from_slice(b"Content-Length: ");
    head.extend_from_slice(content_length.to_string().as_bytes());
    head.extend_from_slice(b"\r\n");

    if keep_alive {
        head.extend_from_slice(b"Connection: keep-alive\r\n");
    } else {
        head.extend_from_slice(b"Connection: close\r\n");
    }

    for (name, value) in &response.headers {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    // Stage through the connection's write buffer so small responses go
    // out in one syscall.
    let mut written = 0;
    {
        let mut buf = wrapper.write_buffer.lock().unwrap();
        buf.reset_empty();
        let staged = buf.append(&head);
        if staged == head.len() && !head_request && !response.has_sendfile() {
            let body_staged = buf.append(&response.body);
            let range = buf.slice(0, buf.limit()).to_vec();
            written += wrapper.write(true, &range)?;
            if body_staged < response.body.len() {
                written += wrapper.write(true, &response.body[body_staged..])?;
            }
            buf.reset_empty();
            wrapper.endpoint().metrics.add_bytes(written);
            return Ok(written);
        }
        buf.reset_empty();
    }

    written += wrapper.write(true, &head)?;
    if !head_request && !response.has_sendfile() {
        written += wrapper.write(true, &response.body)?;
    }
    wrapper.endpoint().metrics.add_bytes(written);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_commit_is_an_illegal_state() {
        let mut res = HttpResponse::new();
        res.commit().unwrap();
        assert!(matches!(res.commit(), Err(KilnError::IllegalState(_))));
    }

    #[test]
    fn set_header_replaces_case_insensitively() {
        let mut res = HttpResponse::new();
        res.set_header("Content-Type", "text/plain");
        res.set_header("content-type", "application/json");
        assert_eq!(res.header("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn recycle_resets_commit_state() {
        let mut res = HttpResponse::new();
        res.set_status(404);
        res.write(b"nope");
        res.commit().unwrap();
        res.recycle();
        assert_eq!(res.status, 200);
        assert!(!res.is_committed());
        assert!(res.body().is_empty());
    }
}
