//! Sentinel LB - load-balancing reverse proxy
//!
//! Core library: backend host management with per-worker connection pools,
//! sticky-session aware host selection, and the exchange forwarder that
//! relays requests and retries them on other backends when that is safe.

pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod server;
