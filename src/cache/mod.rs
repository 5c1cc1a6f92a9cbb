//! Fast in-process cache for key resolution.
//!
//! Sits in front of the lookup index and remembers both hits and misses for a short time.
//! Every entry carries an expiry capped at [`MAX_ENTRY_TTL`]; the janitor sweeps expired
//! entries, LRU eviction handles the rest.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! capacity = 10000
//! positive_ttl_seconds = 300
//! negative_ttl_seconds = 60
//! ```

mod config;
pub(crate) mod lock;
mod store;

pub use config::{FastCacheConfig, MAX_ENTRY_TTL};
pub use store::{CacheStats, CachedIdentity, FastCache};
