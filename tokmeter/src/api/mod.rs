//! HTTP surface of the proxy.
//!
//! - `POST /v1/messages` - forwarded to the upstream messages API and metered
//! - `GET /health` - liveness, never touches the upstream or the metering channel
//! - `GET /internal/metrics` - Prometheus exposition, only when `enable_metrics` is set
//!
//! Routes are assembled in [`crate::build_router`].

pub mod handlers;
