pub mod job;
pub mod queue;
pub mod server;

pub use job::{CreateJob, JobData, JobStateRecord, NewState, StateData};
pub use queue::FetchedJob;
pub use server::{ServerData, ServerRecord};
