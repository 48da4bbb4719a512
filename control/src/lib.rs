//! kgroute - topology resolution and traffic routing for a declared
//! Deployment, Service and Ingress
//!
//! Exposes the manifest model, the routing topology and the HTTP front for
//! the binary and for integration tests.

pub mod apis;
pub mod config;
pub mod error;
pub mod proxy;
pub mod topology;
