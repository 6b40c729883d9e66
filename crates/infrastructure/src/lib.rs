pub mod background;
pub mod connection;
pub mod counters_aggregator;
pub mod database;
pub mod distributed_lock;
pub mod expiration_manager;
pub mod job_queue;
pub mod shutdown;
pub mod storage;
pub mod write_transaction;

pub use background::{run_component, BackgroundComponent};
pub use connection::StorageConnection;
pub use counters_aggregator::{AggregationStats, CountersAggregator, COUNTERS_AGGREGATOR_LOCK};
pub use database::{DatabasePool, DatabaseType};
pub use distributed_lock::{DistributedLockGuard, DistributedLockManager};
pub use expiration_manager::{ExpirationManager, ExpirationStats, EXPIRATION_MANAGER_LOCK};
pub use job_queue::{JobQueue, MAX_CLAIM_ATTEMPTS};
pub use shutdown::{ShutdownManager, ShutdownSignal};
pub use storage::JobStorage;
pub use write_transaction::{KeyedTable, WriteTransaction};
