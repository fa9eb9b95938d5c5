//! Job state: the store that owns every job record and the broadcaster
//! that streams its changes to subscribers.

pub mod job_progress;
pub mod job_store;

pub use job_progress::{JobProgressBroadcaster, JobProgressEvent};
pub use job_store::{JobStore, JobUpdate, NewJob, StartOutcome, StoreCounts};
