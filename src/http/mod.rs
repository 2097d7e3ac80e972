//! HTTP admission middleware and demo server.

mod extractor;
mod middleware;
mod server;

pub use extractor::{HeaderKeyExtractor, KeyExtractor};
pub use middleware::{
    admission_middleware, AdmissionLayer, EXPIRES_AT_HEADER, STATE_HEADER, TOTAL_REQUESTS_HEADER,
};
pub use server::{route_path, router, HttpServer};
