//! Job system: records, lifecycle, and background execution.
//!
//! - `state`: stage state machine (pending → extract → … → completed / failed)
//! - `model`: the persisted `Job` record and partial updates
//! - `manager`: lifecycle manager, sole writer of a job's stage
//! - `runner`: detached execution of a job's steps
//! - `tasks`: the concrete task kinds

pub mod manager;
pub mod model;
pub mod runner;
pub mod state;
pub mod tasks;

pub use manager::{CANCELLED_BY_USER, JobManager};
pub use model::{Job, JobPatch, JobType, JobTypeInfo};
pub use runner::{JobTask, RunnerConfig, StepContext, TaskRunner};
pub use state::JobStage;
pub use tasks::TaskRequest;
