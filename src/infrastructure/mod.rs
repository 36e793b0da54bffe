//! Infrastructure: config, logging, and the HTTP/WebSocket surface.

pub mod config;
pub mod http;
pub mod logging;
pub mod ws;

pub use config::ConfigLoader;
