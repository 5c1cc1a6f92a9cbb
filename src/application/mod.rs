//! Application services: resolution, offloading and retention.

pub mod context;
pub mod error;
pub mod fallback;
pub mod janitor;
pub mod lookup;
pub mod offload;
pub mod repos;
pub mod resolver;
pub mod stats;
pub mod storage;
pub mod watchdog;
