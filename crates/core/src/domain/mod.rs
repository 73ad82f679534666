mod attempt;
mod checkpoint;
mod job;
mod outcome;

pub use attempt::{Attempt, AttemptNumber, AttemptStateMachine, AttemptStatus};
pub use checkpoint::CheckpointState;
pub use job::{ExpectedResult, Job, JobId};
pub use outcome::{
    single_line, FailureRecord, JobOutcome, JobStatus, ValidationReport, ValidationRequest,
};
