//! HTTP/1.1 front end.
//!
//! This module accepts client requests and hands them to the
//! [`ExchangeForwarder`](crate::proxy::forwarder::ExchangeForwarder), which
//! relays each one to a backend chosen by the load balancer.
//!
//! # Architecture
//!
//! - **`body`**: Request body framing, read off the socket in bounded chunks
//! - **`connection`**: Per-client connection state machine
//! - **`headers`**: Ordered, case-insensitive header list
//! - **`parser`**: Parses request and response heads from byte buffers
//! - **`request`**: Inbound request and its (possibly streaming) body
//! - **`response`**: Status codes, response heads and proxy-generated responses
//! - **`writer`**: The `ResponseSink` contract and its HTTP/1.1 implementation
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received
//!               ▼
//!        ┌──────────────────┐
//!        │   Forwarding     │ ← Relay to a backend, stream response back
//!        └──────┬───────────┘
//!               │ Response relayed
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close / abort → Closed
//! ```
//!
//! Malformed requests skip forwarding and go through `Writing` with a
//! locally generated error response.

pub mod body;
pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
