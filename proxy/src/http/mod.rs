//! HTTP surface of the gateway: router, middleware stack and the in-process end-to-end tests.

pub mod server;
