//! Transport layer for the admin process.
//!
//! Provides the HTTP surface via axum.

pub mod http;

pub use http::{AdminState, ServerConfig, serve};
