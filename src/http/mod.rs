//! HTTP layer: key extraction, admission middleware and the server.

mod middleware;
mod server;

pub use middleware::{client_key, rate_limit, router, ADMITTED_BODY, RATE_LIMITED_BODY};
pub use server::HttpServer;
