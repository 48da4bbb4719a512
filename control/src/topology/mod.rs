//! Routing topology: instances, membership, route matching and dispatch

pub mod dispatch;
pub mod health;
pub mod instance;
pub mod labels;
pub mod matcher;
pub mod reconciler;
pub mod resolver;
pub mod snapshot;
pub mod validation;
