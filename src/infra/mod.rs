//! Infrastructure adapters and runtime bootstrap.

pub mod db;
pub mod error;
pub mod memory;
pub mod object_storage;
pub mod sample_log;
pub mod telemetry;
pub mod uploads;
