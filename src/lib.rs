//! Raffica: a caching reverse proxy for static assets.
//!
//! One fixed upstream origin, GET-only, cache-forever semantics. Cached
//! entries carry a tiny self-describing envelope (content-type + body)
//! and are populated through transactional writes so a reader never
//! observes a partially written entry.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod stats;
pub mod telemetry;
pub mod upstream;
