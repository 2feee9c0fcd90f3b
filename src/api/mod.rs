//! HTTP APIs exposed to external clients.

pub mod client_http;
