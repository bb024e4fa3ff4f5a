//! Two-tier cache for books and chapters.
//!
//! - A bounded in-process TTL map answers hot reads
//! - The SQLite store is the merge authority and durable source of truth
//! - Origin fetches never happen here; misses are filled by the job manager

mod key;
mod layer;
mod memory;

pub use key::{CacheKey, Cached};
pub use layer::{CacheStats, HybridCache};
pub use memory::TtlCache;
