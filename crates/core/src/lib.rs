pub mod clock;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AppConfig, DatabaseConfig, LogFormat, ObservabilityConfig, ServerConfig, StorageOptions,
};
pub use errors::{is_transient_database_error, StorageError, StorageResult};
pub use logging::init_logging;
pub use models::{
    CreateJob, FetchedJob, JobData, JobStateRecord, NewState, ServerData, ServerRecord, StateData,
};
