//! HTTP handlers for the proxy's three endpoints.

pub mod messages;
pub mod metrics;
pub mod models;
