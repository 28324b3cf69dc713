use std::time::Instant;

/// One parsed header. Names are lowercased in place by the parser, so
/// lookups are a straight byte comparison.
#[derive(Debug, Clone)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

/// Ordered header collection with case-insensitive access.
#[derive(Debug, Default)]
pub struct MimeHeaders {
    fields: Vec<HeaderField>,
}

impl MimeHeaders {
    /// Start a header; the value is committed later once its line (and any
    /// continuation lines) completes. Returns the field index.
    pub fn add_name(&mut self, name: String) -> usize {
        self.fields.push(HeaderField {
            name,
            value: String::new(),
        });
        self.fields.len() - 1
    }

    pub fn set_value(&mut self, index: usize, value: String) {
        if let Some(field) = self.fields.get_mut(index) {
            field.value = value;
        }
    }

    /// Drop the most recently added header (malformed value lines).
    pub fn remove_last(&mut self) {
        self.fields.pop();
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.fields
            .iter()
            .find(|f| f.name == lower)
            .map(|f| f.value.as_str())
    }

    pub fn values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        let lower = name.to_ascii_lowercase();
        self.fields
            .iter()
            .filter(move |f| f.name == lower)
            .map(|f| f.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn recycle(&mut self) {
        self.fields.clear();
    }
}

/// A parsed HTTP request. Reset (not reallocated) between keep-alive
/// requests on the same connection.
#[derive(Debug, Default)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub query_string: String,
    /// Empty for HTTP/0.9 requests.
    pub protocol: String,
    pub headers: MimeHeaders,
    pub content_length: i64,
    pub start_time: Option<Instant>,
    /// Set by the container dispatch: host and context that served this
    /// request, for access logging.
    pub resolved_host: Option<String>,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            content_length: -1,
            ..Default::default()
        }
    }

    pub fn is_http09(&self) -> bool {
        self.protocol.is_empty()
    }

    pub fn is_http11(&self) -> bool {
        self.protocol == "HTTP/1.1"
    }

    pub fn recycle(&mut self) {
        self.method.clear();
        self.uri.clear();
        self.query_string.clear();
        self.protocol.clear();
        self.headers.recycle();
        self.content_length = -1;
        self.start_time = None;
        self.resolved_host = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = MimeHeaders::default();
        let idx = headers.add_name("host".to_string());
        headers.set_value(idx, "example.com".to_string());
        assert_eq!(headers.get("Host"), Some("example.com"));
        assert_eq!(headers.get("HOST"), Some("example.com"));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn duplicate_headers_keep_order() {
        let mut headers = MimeHeaders::default();
        let a = headers.add_name("x-item".to_string());
        headers.set_value(a, "1".to_string());
        let b = headers.add_name("x-item".to_string());
        headers.set_value(b, "2".to_string());
        let values: Vec<&str> = headers.values("X-Item").collect();
        assert_eq!(values, vec!["1", "2"]);
    }

    #[test]
    fn recycle_clears_everything() {
        let mut req = HttpRequest::new();
        req.method = "GET".into();
        req.content_length = 42;
        let idx = req.headers.add_name("a".into());
        req.headers.set_value(idx, "b".into());
        req.recycle();
        assert!(req.method.is_empty());
        assert_eq!(req.content_length, -1);
        assert!(req.headers.is_empty());
    }
}
