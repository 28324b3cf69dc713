use serde::Deserialize;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Endpoint configuration. Every field has a working default so
/// `Config::from_env()` always succeeds; the environment overrides
/// individual knobs (`KILN_PORT=8080`, `KILN_MAX_CONNECTIONS=2048`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bind address (default: 0.0.0.0)
    pub address: String,

    /// Bind port (default: 8080)
    pub port: u16,

    /// Listen backlog handed to the kernel (default: 100)
    pub accept_count: i32,

    /// Cap on concurrently open connections; <= 0 disables the cap
    /// (default: 8192)
    pub max_connections: i64,

    /// Read timeout once request data has started arriving, ms
    /// (default: 20000)
    pub connection_timeout_ms: u64,

    /// Read timeout while waiting for the next keep-alive request, ms
    /// (default: same as connection_timeout_ms)
    pub keep_alive_timeout_ms: u64,

    /// Requests served per connection before forcing close;
    /// 1 disables keep-alive, -1 means unlimited (default: 100)
    pub max_keep_alive_requests: i32,

    /// Upper bound on the poller's blocking select, ms (default: 1000)
    pub selector_timeout_ms: u64,

    /// Poller thread priority hint, recorded but advisory on Linux
    /// (default: 5)
    pub poller_thread_priority: i32,

    /// Throttle interval for the poller's timeout sweep, ms (default: 1000)
    pub timeout_interval_ms: u64,

    /// Socket-processor cache capacity; 0 disables caching (default: 200)
    pub processor_cache: usize,

    /// Poller-event cache capacity; 0 disables caching (default: 500)
    pub event_cache: usize,

    /// Channel-wrapper/buffer cache capacity; 0 disables caching
    /// (default: 500)
    pub buffer_pool: usize,

    /// Per-connection application read buffer size (default: 8192)
    pub app_read_buf_size: usize,

    /// Per-connection application write buffer size (default: 8192)
    pub app_write_buf_size: usize,

    /// Accepted for compatibility; heap buffers are always used
    pub direct_buffer: bool,

    /// Worker pool size (default: number of CPUs)
    pub worker_threads: usize,

    /// Secondary selectors available for blocking worker I/O (default: 128)
    pub selector_pool_size: usize,

    /// Request line + headers byte budget (default: 8192)
    pub max_http_header_size: usize,

    /// Fail requests carrying malformed headers instead of skipping the
    /// offending line (default: false)
    pub reject_illegal_header: bool,

    /// Extra bytes tolerated in request paths beyond the RFC set
    pub relaxed_path_chars: String,

    /// Extra bytes tolerated in query strings beyond the RFC set
    pub relaxed_query_chars: String,

    /// Adopt this pre-bound listening socket instead of binding a new one
    pub inherited_fd: Option<i32>,

    pub socket: SocketConfig,
    pub tls: TlsSettings,
}

/// Options applied to the listen socket at bind time and inherited (or
/// re-applied) on accepted sockets.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    pub reuse_address: bool,
    pub tcp_no_delay: bool,
    pub so_keep_alive: bool,
    /// Receive buffer size; 0 leaves the kernel default
    pub rcv_buf: i32,
    /// Send buffer size; 0 leaves the kernel default
    pub snd_buf: i32,
    /// SO_LINGER seconds; negative disables
    pub linger: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            reuse_address: true,
            tcp_no_delay: true,
            so_keep_alive: false,
            rcv_buf: 0,
            snd_buf: 0,
            linger: -1,
        }
    }
}

/// TLS settings. The keystore is a PEM certificate chain plus private key;
/// client authentication verifies peers against `ca_file`.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub enabled: bool,
    /// Allowed protocol versions, e.g. ["TLSv1.2", "TLSv1.3"]
    pub protocols: Vec<String>,
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
    pub client_auth: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            protocols: vec!["TLSv1.2".to_string(), "TLSv1.3".to_string()],
            cert_file: String::new(),
            key_file: String::new(),
            ca_file: String::new(),
            client_auth: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
            accept_count: 100,
            max_connections: 8192,
            connection_timeout_ms: 20_000,
            keep_alive_timeout_ms: 20_000,
            max_keep_alive_requests: 100,
            selector_timeout_ms: 1000,
            poller_thread_priority: 5,
            timeout_interval_ms: 1000,
            processor_cache: 200,
            event_cache: 500,
            buffer_pool: 500,
            app_read_buf_size: 8192,
            app_write_buf_size: 8192,
            direct_buffer: false,
            worker_threads: num_cpus::get(),
            selector_pool_size: 128,
            max_http_header_size: 8192,
            reject_illegal_header: false,
            relaxed_path_chars: String::new(),
            relaxed_query_chars: String::new(),
            inherited_fd: None,
            socket: SocketConfig::default(),
            tls: TlsSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        let connection_timeout_ms = env_or("KILN_CONNECTION_TIMEOUT_MS", defaults.connection_timeout_ms);
        Config {
            address: env_string("KILN_ADDRESS", &defaults.address),
            port: env_or("KILN_PORT", defaults.port),
            accept_count: env_or("KILN_ACCEPT_COUNT", defaults.accept_count),
            max_connections: env_or("KILN_MAX_CONNECTIONS", defaults.max_connections),
            connection_timeout_ms,
            keep_alive_timeout_ms: env_or("KILN_KEEP_ALIVE_TIMEOUT_MS", connection_timeout_ms),
            max_keep_alive_requests: env_or("KILN_MAX_KEEP_ALIVE_REQUESTS", defaults.max_keep_alive_requests),
            selector_timeout_ms: env_or("KILN_SELECTOR_TIMEOUT_MS", defaults.selector_timeout_ms),
            poller_thread_priority: env_or("KILN_POLLER_THREAD_PRIORITY", defaults.poller_thread_priority),
            timeout_interval_ms: env_or("KILN_TIMEOUT_INTERVAL_MS", defaults.timeout_interval_ms),
            processor_cache: env_or("KILN_PROCESSOR_CACHE", defaults.processor_cache),
            event_cache: env_or("KILN_EVENT_CACHE", defaults.event_cache),
            buffer_pool: env_or("KILN_BUFFER_POOL", defaults.buffer_pool),
            app_read_buf_size: env_or("KILN_APP_READ_BUF_SIZE", defaults.app_read_buf_size),
            app_write_buf_size: env_or("KILN_APP_WRITE_BUF_SIZE", defaults.app_write_buf_size),
            direct_buffer: env_or("KILN_DIRECT_BUFFER", defaults.direct_buffer),
            worker_threads: env_or("KILN_WORKER_THREADS", defaults.worker_threads),
            selector_pool_size: env_or("KILN_SELECTOR_POOL_SIZE", defaults.selector_pool_size),
            max_http_header_size: env_or("KILN_MAX_HTTP_HEADER_SIZE", defaults.max_http_header_size),
            reject_illegal_header: env_or("KILN_REJECT_ILLEGAL_HEADER", defaults.reject_illegal_header),
            relaxed_path_chars: env_string("KILN_RELAXED_PATH_CHARS", ""),
            relaxed_query_chars: env_string("KILN_RELAXED_QUERY_CHARS", ""),
            inherited_fd: std::env::var("KILN_INHERITED_FD").ok().and_then(|v| v.parse().ok()),
            socket: SocketConfig {
                reuse_address: env_or("KILN_SO_REUSEADDR", true),
                tcp_no_delay: env_or("KILN_TCP_NODELAY", true),
                so_keep_alive: env_or("KILN_SO_KEEPALIVE", false),
                rcv_buf: env_or("KILN_SO_RCVBUF", 0),
                snd_buf: env_or("KILN_SO_SNDBUF", 0),
                linger: env_or("KILN_SO_LINGER", -1),
            },
            tls: TlsSettings {
                enabled: env_or("KILN_SSL_ENABLED", false),
                protocols: env_string("KILN_SSL_PROTOCOLS", "TLSv1.2,TLSv1.3")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                cert_file: env_string("KILN_CERT_FILE", ""),
                key_file: env_string("KILN_KEY_FILE", ""),
                ca_file: env_string("KILN_CA_FILE", ""),
                client_auth: env_or("KILN_CLIENT_AUTH", false),
            },
        }
    }

    /// Full bind address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Keep-alive disabled entirely when the budget is exactly one request.
    pub fn keep_alive_enabled(&self) -> bool {
        self.max_keep_alive_requests != 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.port, 8080);
        assert_eq!(c.max_http_header_size, 8192);
        assert_eq!(c.keep_alive_timeout_ms, c.connection_timeout_ms);
        assert!(c.keep_alive_enabled());
        assert_eq!(c.server_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn keep_alive_budget_of_one_disables_reuse() {
        let mut c = Config::default();
        c.max_keep_alive_requests = 1;
        assert!(!c.keep_alive_enabled());
        c.max_keep_alive_requests = -1;
        assert!(c.keep_alive_enabled());
    }
}
