//! 按键复用的资源池

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{PoolConfig, PoolError, Result};

/// 后端资源工厂
///
/// `create` 建立一个后端句柄，`free` 负责释放。句柄需要可克隆，
/// 以便同一个键的所有请求方拿到同一个实例。
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;
    type Args: Send + 'static;

    async fn create(&self, args: Self::Args) -> Result<Self::Handle>;

    async fn free(&self, handle: Self::Handle);
}

type PendingHandle<H> = Shared<BoxFuture<'static, Result<H>>>;

enum PoolEntry<H> {
    /// 正在创建，并发请求共享同一个创建过程
    Pending { version: u64, future: PendingHandle<H> },
    /// 已就绪
    Ready {
        instance: H,
        version: u64,
        last_use: Instant,
    },
}

/// 资源池统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub ready: usize,
    pub pending: usize,
}

/// 资源池
pub struct ResourcePool<F: ResourceFactory> {
    name: String,
    factory: Arc<F>,
    entries: Arc<Mutex<HashMap<String, PoolEntry<F::Handle>>>>,
    config: PoolConfig,
    next_version: AtomicU64,
    stopped: AtomicBool,
    sweeper_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// 创建新的资源池
    pub fn new(name: &str, factory: F, config: PoolConfig) -> Self {
        Self {
            name: name.to_string(),
            factory: Arc::new(factory),
            entries: Arc::new(Mutex::new(HashMap::new())),
            config,
            next_version: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            sweeper_shutdown: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// 获取句柄，不存在时创建
    pub async fn get(&self, key: &str, args: F::Args) -> Result<F::Handle> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PoolError::Stopped);
        }

        let (version, future) = {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(key) {
                Some(PoolEntry::Ready {
                    instance, last_use, ..
                }) => {
                    *last_use = Instant::now();
                    return Ok(instance.clone());
                }
                Some(PoolEntry::Pending { version, future }) => (*version, future.clone()),
                None => {
                    let version = self.next_version.fetch_add(1, Ordering::SeqCst);
                    debug!("[{}] 创建资源: {} (v{})", self.name, key, version);
                    let factory = Arc::clone(&self.factory);
                    let future = async move { factory.create(args).await }.boxed().shared();
                    entries.insert(
                        key.to_string(),
                        PoolEntry::Pending {
                            version,
                            future: future.clone(),
                        },
                    );
                    (version, future)
                }
            }
        };

        let outcome = future.await;

        let mut entries = self.entries.lock().await;
        let current = match entries.get(key) {
            Some(PoolEntry::Pending { version: v, .. }) | Some(PoolEntry::Ready { version: v, .. }) => {
                Some(*v)
            }
            None => None,
        };

        match outcome {
            Ok(instance) => {
                // 第一个拿到结果的请求方负责把条目转为就绪
                if current == Some(version) {
                    if let Some(PoolEntry::Pending { .. }) = entries.get(key) {
                        entries.insert(
                            key.to_string(),
                            PoolEntry::Ready {
                                instance: instance.clone(),
                                version,
                                last_use: Instant::now(),
                            },
                        );
                        info!("[{}] 资源已就绪: {}", self.name, key);
                    }
                }
                Ok(instance)
            }
            Err(e) => {
                if current == Some(version) {
                    entries.remove(key);
                    warn!("[{}] 创建资源失败，已移除: {} - {}", self.name, key, e);
                }
                Err(e)
            }
        }
    }

    /// 是否存在指定键的条目
    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    /// 主动移除并释放
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.entries.lock().await.remove(key);
        match removed {
            Some(PoolEntry::Ready { instance, .. }) => {
                self.factory.free(instance).await;
                true
            }
            Some(PoolEntry::Pending { .. }) => true,
            None => false,
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let entries = self.entries.lock().await;
        let mut stats = PoolStats::default();
        for entry in entries.values() {
            match entry {
                PoolEntry::Ready { .. } => stats.ready += 1,
                PoolEntry::Pending { .. } => stats.pending += 1,
            }
        }
        stats
    }

    /// 回收空闲超时的条目，返回回收数量
    ///
    /// 不区分句柄是否仍被使用，调用方需要能处理句柄失效后重新获取。
    pub async fn sweep(&self) -> usize {
        sweep_entries(&self.name, &self.entries, self.factory.as_ref(), self.config.idle_timeout()).await
    }

    /// 启动空闲回收任务
    pub async fn start(&self) {
        let mut guard = self.sweeper_shutdown.lock().await;
        if guard.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let name = self.name.clone();
        let entries = Arc::clone(&self.entries);
        let factory = Arc::clone(&self.factory);
        let idle_timeout = self.config.idle_timeout();
        let sweep_interval = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = sweep_entries(&name, &entries, factory.as_ref(), idle_timeout).await;
                        if evicted > 0 {
                            debug!("[{}] 回收空闲资源 {} 个", name, evicted);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("[{}] 空闲回收任务已停止", name);
                        break;
                    }
                }
            }
        });

        *guard = Some(shutdown_tx);
        info!(
            "[{}] 资源池已启动 (空闲超时 {:?}, 检查间隔 {:?})",
            self.name, idle_timeout, sweep_interval
        );
    }

    /// 停止回收任务并释放所有句柄
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        if let Some(tx) = self.sweeper_shutdown.lock().await.take() {
            let _ = tx.send(());
        }

        let drained: Vec<(String, PoolEntry<F::Handle>)> =
            self.entries.lock().await.drain().collect();
        for (key, entry) in drained {
            if let PoolEntry::Ready { instance, .. } = entry {
                debug!("[{}] 释放资源: {}", self.name, key);
                self.factory.free(instance).await;
            }
        }
        info!("[{}] 资源池已停止", self.name);
    }
}

async fn sweep_entries<F: ResourceFactory>(
    name: &str,
    entries: &Mutex<HashMap<String, PoolEntry<F::Handle>>>,
    factory: &F,
    idle_timeout: Duration,
) -> usize {
    let expired: Vec<(String, F::Handle)> = {
        let mut guard = entries.lock().await;
        let now = Instant::now();
        let keys: Vec<String> = guard
            .iter()
            .filter_map(|(key, entry)| match entry {
                PoolEntry::Ready { last_use, .. }
                    if now.duration_since(*last_use) > idle_timeout =>
                {
                    Some(key.clone())
                }
                _ => None,
            })
            .collect();

        keys.into_iter()
            .filter_map(|key| match guard.remove(&key) {
                Some(PoolEntry::Ready { instance, .. }) => Some((key, instance)),
                _ => None,
            })
            .collect()
    };

    let count = expired.len();
    for (key, instance) in expired {
        debug!("[{}] 资源空闲超时，释放: {}", name, key);
        factory.free(instance).await;
    }
    count
}

/// 由连接配置生成确定性的连接指纹
///
/// 按给定字段顺序取值，以 `:` 拼接；缺失字段为空串。
pub fn connection_key(config: &Value, fields: &[&str]) -> String {
    fields
        .iter()
        .map(|field| match config.get(*field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        freed: AtomicUsize,
        fail_first: AtomicBool,
    }

    #[async_trait]
    impl ResourceFactory for Arc<CountingFactory> {
        type Handle = usize;
        type Args = ();

        async fn create(&self, _args: ()) -> Result<usize> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(PoolError::CreateFailed("拒绝连接".to_string()));
            }
            Ok(n)
        }

        async fn free(&self, _handle: usize) {
            self.freed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_concurrent_get_creates_once() {
        let counter = Arc::new(CountingFactory::default());
        let pool = Arc::new(ResourcePool::new("test", counter.clone(), PoolConfig::default()));

        let handles = futures::future::join_all((0..10).map(|_| {
            let pool = pool.clone();
            async move { pool.get("db:5432", ()).await }
        }))
        .await;

        assert_eq!(counter.created.load(Ordering::SeqCst), 1);
        for handle in handles {
            assert_eq!(handle.unwrap(), 1);
        }
        assert_eq!(pool.stats().await, PoolStats { ready: 1, pending: 0 });
    }

    #[tokio::test]
    async fn test_failed_creation_is_evicted() {
        let counter = Arc::new(CountingFactory::default());
        counter.fail_first.store(true, Ordering::SeqCst);
        let pool = ResourcePool::new("test", counter.clone(), PoolConfig::default());

        assert!(pool.get("k", ()).await.is_err());
        assert!(!pool.contains("k").await);

        assert_eq!(pool.get("k", ()).await.unwrap(), 2);
        assert_eq!(counter.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entries_are_swept() {
        let counter = Arc::new(CountingFactory::default());
        let pool = ResourcePool::new("test", counter.clone(), PoolConfig::default());
        pool.start().await;

        pool.get("k", ()).await.unwrap();
        assert!(pool.contains("k").await);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(pool.contains("k").await);

        tokio::time::sleep(Duration::from_secs(140)).await;
        assert!(!pool.contains("k").await);
        assert_eq!(counter.freed.load(Ordering::SeqCst), 1);

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sweep_frees_idle_entries() {
        let counter = Arc::new(CountingFactory::default());
        let pool = ResourcePool::new("test", counter.clone(), PoolConfig::default());

        pool.get("k", ()).await.unwrap();
        assert_eq!(pool.sweep().await, 0);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(pool.sweep().await, 1);
        assert!(!pool.contains("k").await);
        assert_eq!(counter.freed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_frees_everything() {
        let counter = Arc::new(CountingFactory::default());
        let pool = ResourcePool::new("test", counter.clone(), PoolConfig::default());
        pool.get("a", ()).await.unwrap();
        pool.get("b", ()).await.unwrap();

        pool.stop().await;
        assert_eq!(counter.freed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.get("a", ()).await, Err(PoolError::Stopped));
    }

    #[test]
    fn test_connection_key() {
        let config = json!({"host": "10.0.0.1", "port": 3306, "user": "root"});
        assert_eq!(
            connection_key(&config, &["host", "port", "user", "password"]),
            "10.0.0.1:3306:root:"
        );
    }
}
