//! HTTP/1.1 wire handling: the resumable request parser, body input
//! filters, response serialization and the per-connection processor.

pub mod filters;
pub mod input_buffer;
pub mod processor;
pub mod request;
pub mod response;
pub mod tokens;

pub use input_buffer::{HttpInputBuffer, InputSource, CLIENT_PREFACE};
pub use processor::{Adapter, Http11Handler};
pub use request::{HttpRequest, MimeHeaders};
pub use response::HttpResponse;
