//! StepRun 资源池
//!
//! 按连接指纹复用昂贵的后端句柄（数据库连接、RPC 通道等），
//! 并周期性回收空闲句柄。资源池归工作线程所有，不在工作线程之间共享。

pub mod config;
pub mod datasource;
pub mod pool;

pub use config::PoolConfig;
pub use datasource::{DataSourceProvider, DataSourceRegistry, MemoryDataSource};
pub use pool::{connection_key, PoolStats, ResourceFactory, ResourcePool};

use thiserror::Error;

/// 资源池错误
///
/// 等待中的创建结果会被多个请求方共享，因此错误需要可克隆。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("创建资源失败: {0}")]
    CreateFailed(String),

    #[error("资源池已停止")]
    Stopped,

    #[error("数据源类型 {0} 未注册")]
    ProviderNotFound(String),

    #[error("数据源类型 {0} 已注册")]
    ProviderAlreadyRegistered(String),

    #[error("数据源配置错误: {0}")]
    ConfigError(String),

    #[error("数据源执行失败: {0}")]
    ExecuteFailed(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;
