//! 数据源提供者注册表
//!
//! 插件按数据源类型标签注册提供者，供连通性测试和数据集步骤查询使用。

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{connection_key, PoolConfig, PoolError, ResourceFactory, ResourcePool, Result};

/// 数据源提供者
#[async_trait]
pub trait DataSourceProvider: Send + Sync {
    /// 数据源类型标签
    fn source_type(&self) -> &str;

    /// 测试连通性，成功时返回连接摘要
    async fn test_connection(&self, config: &Value) -> Result<Value>;

    /// 执行一条命令，返回行列表
    async fn execute(&self, config: &Value, command: &str) -> Result<Vec<Value>>;

    /// 启动后台任务 (如空闲连接回收)
    async fn start(&self) {}

    /// 释放提供者持有的连接
    async fn shutdown(&self) {}
}

/// 数据源提供者注册表
pub struct DataSourceRegistry {
    providers: Arc<RwLock<HashMap<String, Arc<dyn DataSourceProvider>>>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self {
            providers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 注册提供者
    pub async fn register(&self, provider: Arc<dyn DataSourceProvider>) -> Result<()> {
        let source_type = provider.source_type().to_string();
        info!("注册数据源类型: {}", source_type);

        let mut providers = self.providers.write().await;
        if providers.contains_key(&source_type) {
            return Err(PoolError::ProviderAlreadyRegistered(source_type));
        }
        provider.start().await;
        providers.insert(source_type, provider);
        Ok(())
    }

    /// 注销提供者
    pub async fn unregister(&self, source_type: &str) -> Result<()> {
        info!("注销数据源类型: {}", source_type);
        let provider = self
            .providers
            .write()
            .await
            .remove(source_type)
            .ok_or_else(|| PoolError::ProviderNotFound(source_type.to_string()))?;
        provider.shutdown().await;
        Ok(())
    }

    pub async fn get(&self, source_type: &str) -> Result<Arc<dyn DataSourceProvider>> {
        debug!("获取数据源提供者: {}", source_type);
        self.providers
            .read()
            .await
            .get(source_type)
            .cloned()
            .ok_or_else(|| PoolError::ProviderNotFound(source_type.to_string()))
    }

    pub async fn list(&self) -> Vec<String> {
        self.providers.read().await.keys().cloned().collect()
    }

    pub async fn test_connection(&self, source_type: &str, config: &Value) -> Result<Value> {
        self.get(source_type).await?.test_connection(config).await
    }

    pub async fn execute(&self, source_type: &str, config: &Value, command: &str) -> Result<Vec<Value>> {
        self.get(source_type).await?.execute(config, command).await
    }

    /// 关闭所有提供者
    pub async fn shutdown(&self) {
        let providers: Vec<Arc<dyn DataSourceProvider>> =
            self.providers.write().await.drain().map(|(_, p)| p).collect();
        for provider in providers {
            provider.shutdown().await;
        }
    }
}

impl Default for DataSourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 内存表连接
type MemoryTables = Arc<Map<String, Value>>;

struct MemoryConnector;

#[async_trait]
impl ResourceFactory for MemoryConnector {
    type Handle = MemoryTables;
    type Args = Value;

    async fn create(&self, config: Value) -> Result<MemoryTables> {
        if let Some(reason) = config.get("refuse").and_then(Value::as_str) {
            return Err(PoolError::CreateFailed(reason.to_string()));
        }
        match config.get("tables") {
            Some(Value::Object(tables)) => Ok(Arc::new(tables.clone())),
            None => Ok(Arc::new(Map::new())),
            Some(_) => Err(PoolError::ConfigError("tables 必须是对象".to_string())),
        }
    }

    async fn free(&self, _handle: MemoryTables) {}
}

/// 内存数据源 (类型标签 `memory`)
///
/// 配置形如 `{"name": "fixtures", "tables": {"users": [{...}]}}`，
/// 命令为表名，可带 `limit N` 后缀。连接经由资源池复用。
pub struct MemoryDataSource {
    pool: ResourcePool<MemoryConnector>,
}

impl MemoryDataSource {
    pub const TYPE: &'static str = "memory";

    pub fn new(config: PoolConfig) -> Self {
        Self {
            pool: ResourcePool::new(Self::TYPE, MemoryConnector, config),
        }
    }

    async fn connect(&self, config: &Value) -> Result<MemoryTables> {
        let key = connection_key(config, &["name", "host", "port", "database"]);
        self.pool.get(&key, config.clone()).await
    }
}

impl Default for MemoryDataSource {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[async_trait]
impl DataSourceProvider for MemoryDataSource {
    fn source_type(&self) -> &str {
        Self::TYPE
    }

    async fn test_connection(&self, config: &Value) -> Result<Value> {
        let tables = self.connect(config).await?;
        let mut names: Vec<&String> = tables.keys().collect();
        names.sort();
        Ok(serde_json::json!({ "connected": true, "tables": names }))
    }

    async fn execute(&self, config: &Value, command: &str) -> Result<Vec<Value>> {
        let tables = self.connect(config).await?;

        let mut parts = command.split_whitespace();
        let table = parts
            .next()
            .ok_or_else(|| PoolError::ExecuteFailed("命令为空".to_string()))?;
        let limit = match (parts.next(), parts.next()) {
            (Some(kw), Some(n)) if kw.eq_ignore_ascii_case("limit") => Some(
                n.parse::<usize>()
                    .map_err(|_| PoolError::ExecuteFailed(format!("无效的 limit: {}", n)))?,
            ),
            (None, _) => None,
            _ => return Err(PoolError::ExecuteFailed(format!("无法解析命令: {}", command))),
        };

        let rows = tables
            .get(table)
            .and_then(Value::as_array)
            .ok_or_else(|| PoolError::ExecuteFailed(format!("表 {} 不存在", table)))?;

        Ok(rows
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn start(&self) {
        self.pool.start().await;
    }

    async fn shutdown(&self) {
        self.pool.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixtures() -> Value {
        json!({
            "name": "fixtures",
            "tables": {"users": [{"id": 1}, {"id": 2}, {"id": 3}]}
        })
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let registry = DataSourceRegistry::new();
        registry
            .register(Arc::new(MemoryDataSource::default()))
            .await
            .unwrap();
        let err = registry
            .register(Arc::new(MemoryDataSource::default()))
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::ProviderAlreadyRegistered("memory".to_string()));
        assert_eq!(registry.list().await, vec!["memory".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_execute() {
        let registry = DataSourceRegistry::new();
        registry
            .register(Arc::new(MemoryDataSource::default()))
            .await
            .unwrap();

        let rows = registry.execute("memory", &fixtures(), "users limit 2").await.unwrap();
        assert_eq!(rows, vec![json!({"id": 1}), json!({"id": 2})]);

        let summary = registry.test_connection("memory", &fixtures()).await.unwrap();
        assert_eq!(summary["tables"], json!(["users"]));

        assert!(registry.execute("memory", &fixtures(), "orders").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let registry = DataSourceRegistry::new();
        let err = registry.test_connection("mysql", &json!({})).await.unwrap_err();
        assert_eq!(err, PoolError::ProviderNotFound("mysql".to_string()));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let source = MemoryDataSource::default();
        let err = source
            .test_connection(&json!({"name": "x", "refuse": "认证失败"}))
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::CreateFailed("认证失败".to_string()));
    }
}
