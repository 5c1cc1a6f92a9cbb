//! Durable offload queue driving uploads to remote object storage.
//!
//! Tasks move `pending → uploading → {completed | pending (retry) | abandoned}`. At most one
//! live task exists per identity. A completed upload leaves the local copy in place until
//! the consumer signals that processing finished, or until the grace period runs out.

mod deletion;
pub mod policy;
mod queue;
pub mod slots;

pub use policy::{BackoffSchedule, RetryDecision, upload_timeout};
pub use queue::{AbandonedTask, OffloadConfig, OffloadQueue, ProcessingOutcome, TickStats};
pub use slots::{InFlightUploads, UploadSlots};
