mod events;
mod orchestrator;
mod registry;
mod store;
mod types;

pub use events::{ChunkOutcome, JobEvent, JobUpdate};
pub use orchestrator::{
    snapshot, sweep_completed, JobRequest, Orchestrator, ResumeOutcome, StartedJob,
};
pub use store::FileStore;
pub use types::{DocumentJob, JobSnapshot, JobStatus};

#[cfg(test)]
pub use store::MemoryStore;
