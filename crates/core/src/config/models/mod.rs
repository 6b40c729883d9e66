pub mod app_config;
pub mod database;
pub mod observability;
pub mod server;
pub mod storage;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use observability::{LogFormat, ObservabilityConfig};
pub use server::ServerConfig;
pub use storage::StorageOptions;
