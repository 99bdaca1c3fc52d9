//! HTTP API Module
//!
//! Provides a read-only REST API over the node's membership state.

mod http;

pub use http::{HttpServer, NodeEntry, StatusResponse};
