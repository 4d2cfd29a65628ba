mod job;
mod state;
mod transition;

pub use job::{Job, JobEvent, JobFields, Machine, job_key, normalize_base};
pub use state::{JobStatus, StateMachine, Transition, Trigger};
pub use transition::{Advance, advance};
