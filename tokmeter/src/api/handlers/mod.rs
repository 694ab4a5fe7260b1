//! Axum route handlers.
//!
//! - [`messages`]: the metered proxy endpoint
//! - [`health`]: liveness probe
//!
//! Handlers return [`crate::errors::Error`] which converts to a JSON `{"error": ...}` body with
//! the matching status code.

pub mod health;
pub mod messages;
