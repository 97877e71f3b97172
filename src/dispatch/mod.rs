mod job;
mod pacing;
mod scheduler;
mod state;

pub use job::{
    AttemptOutcome, DispatchAttempt, DispatchJob, JobPlan, SkippedGroup, build_jobs,
};
pub use pacing::{PacingConfig, RetryBackoff};
pub use scheduler::DispatchScheduler;
pub use state::{Command, RunState};
