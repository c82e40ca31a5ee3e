//! Step cache.
//!
//! - `StepCache`: maps a step's cache key to the image it produced
//! - `digest`: SHA256 helpers for keys and `copy` sources

pub mod digest;
pub mod step_cache;

pub use digest::{sha256_bytes, sha256_path};
pub use step_cache::{CacheEntry, CacheKey, CacheStats, StepCache, CACHE_FILE};
