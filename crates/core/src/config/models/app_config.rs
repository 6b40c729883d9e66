use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig, observability::ObservabilityConfig, server::ServerConfig,
    storage::StorageOptions,
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub storage: StorageOptions,
    pub server: ServerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: JOBSTORE, separator: `__`)
    ///
    /// 例如 `JOBSTORE__DATABASE__URL` 覆盖 `database.url`。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/jobstore.toml",
                "jobstore.toml",
                "/etc/jobstore/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("JOBSTORE")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.queues")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.storage.validate().context("存储配置验证失败")?;
        self.server.validate().context("服务器配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial_sections_use_defaults() {
        let toml_str = r#"
[database]
url = "sqlite:/var/lib/jobstore/jobs.db"
max_connections = 4

[storage]
invisibility_timeout_seconds = 60
aggregation_batch_size = 50
"#;

        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.database.url, "sqlite:/var/lib/jobstore/jobs.db");
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.database.connect_retries, 3);
        assert_eq!(config.storage.invisibility_timeout_seconds, 60);
        assert_eq!(config.storage.aggregation_batch_size, 50);
        assert_eq!(config.storage.expiration_batch_size, 1000);
        assert_eq!(config.server.queues, vec!["default".to_string()]);
    }

    #[test]
    fn test_from_toml_rejects_invalid_values() {
        let toml_str = r#"
[storage]
expiration_batch_size = 0
"#;
        assert!(AppConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = AppConfig::default();
        config.server.queues = vec!["critical".to_string(), "default".to_string()];
        config.database.schema_name = Some("jobs".to_string());

        let toml_str = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&toml_str).unwrap();

        assert_eq!(parsed.server.queues, config.server.queues);
        assert_eq!(parsed.database.schema_name.as_deref(), Some("jobs"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "postgresql://db.internal/jobs"

[server]
queues = ["critical", "default"]
worker_count = 8
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.database.url, "postgresql://db.internal/jobs");
        assert_eq!(config.server.worker_count, 8);
        assert_eq!(config.server.queues.len(), 2);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = AppConfig::load(Some("/nonexistent/jobstore.toml"));
        assert!(result.is_err());
    }
}
