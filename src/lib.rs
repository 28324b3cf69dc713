//! kiln: an event-driven HTTP/1.1 application-server core.
//!
//! Three layers:
//! - [`endpoint`]: the socket endpoint (acceptor, poller, worker pool,
//!   pooled per-connection state, TLS, sendfile).
//! - [`http`]: resumable request-line/header parsing, body filters and
//!   the HTTP/1.1 processor.
//! - [`container`]: the engine/host/context/wrapper tree with valve
//!   pipelines and background housekeeping.

pub mod config;
pub mod container;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod syscalls;

pub use config::Config;
pub use container::{Container, EngineAdapter};
pub use endpoint::Endpoint;
pub use error::{KilnError, KilnResult};
pub use http::Http11Handler;
pub use lifecycle::{Lifecycle, LifecycleState};
pub use logging::init_logging;
