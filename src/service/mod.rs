//! HTTP service: REST API, live progress channel and the provisioning pipeline.
//!
//! - `api`: router, shared state, error mapping and handlers
//! - `auth`: bearer-token verification and request extractors
//! - `github`: remote repository client
//! - `provision`: repository provisioning jobs
//! - `template`: template rendering
//! - `progress`: per-user fan-out of progress frames
//! - `rate_limit`: sliding-window admission control
//! - `store`: project records
//! - `ws`: live channel socket loop
//! - `server`: middleware stack and startup

pub mod api;
pub mod auth;
pub mod github;
pub mod models;
pub mod progress;
pub mod provision;
pub mod rate_limit;
pub mod server;
pub mod store;
pub mod template;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;
