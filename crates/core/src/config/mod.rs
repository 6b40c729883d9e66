//! 配置管理
//!
//! 加载顺序：
//! 1. 内置默认值
//! 2. 配置文件（TOML格式）
//! 3. 环境变量覆盖（前缀 `JOBSTORE`，层级分隔符 `__`）
//!
//! 每个配置段都提供 `validate()`，加载完成后统一校验。

pub mod models;

pub use models::*;
