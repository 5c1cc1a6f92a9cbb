//! Key resolution with a tiered lookup path, plus durable offloading of local files to
//! remote object storage.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
