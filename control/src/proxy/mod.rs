//! HTTP data path: server, upstream transport, and metrics

pub mod metrics;
pub mod server;
pub mod upstream;
