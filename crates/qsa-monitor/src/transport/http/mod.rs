//! Admin HTTP API over the connection registry.

mod routes;
mod server;

pub use routes::{AdminState, ApiError, routes};
pub use server::{ServerConfig, serve, serve_with_shutdown};
