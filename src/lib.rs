//! Caching and background-refresh core for a scraped serial-fiction origin.
//!
//! [`app::AppContext`] wires the services together: a hybrid memory/SQLite cache, a
//! deduplicated refresh job manager, the daily and periodic sync orchestrators, and a
//! per-client rate limiter for the public API.

pub mod app;
pub mod cache;
pub mod config;
pub mod db;
pub mod jobs;
pub mod origin;
pub mod ratelimit;
pub mod sync;
pub mod telemetry;
pub mod types;
