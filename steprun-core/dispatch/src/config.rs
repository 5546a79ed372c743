//! 引擎配置
//!
//! 支持从多个源加载配置:
//! - 环境变量 (优先级最高)
//! - 配置文件 (TOML/YAML/JSON)
//! - 默认值 (优先级最低)
//!
//! 配置文件搜索路径 (按优先级):
//! 1. `STEPRUN_CONFIG` 环境变量指定的路径
//! 2. `./steprun.toml` / `./steprun.yaml` / `./steprun.json` (当前目录)
//! 3. `~/.config/steprun/config.toml` (用户配置目录)
//! 4. `/etc/steprun/config.toml` (系统配置目录)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use steprun_pool::PoolConfig;
use steprun_sandbox::SandboxConfig;

/// 引擎配置 (顶层)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 调度配置
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// 资源池配置
    #[serde(default)]
    pub pool: PoolConfig,

    /// 脚本沙箱配置
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// 工作线程数，未设置时取可用并行度
    #[serde(default)]
    pub workers: Option<usize>,

    /// 全局并发上限，未设置时等于工作线程数，设置时也不超过工作线程数
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// 单次执行超时 (秒)，0 表示不限制
    #[serde(default)]
    pub timeout: u64,

    /// 工作线程异常退出后的重试次数
    #[serde(default)]
    pub retry: u32,

    /// 心跳间隔 (毫秒)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// 连续丢失多少次心跳后判定工作线程失联
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,

    /// 每个工作线程保留多少个已结束的执行供查询
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别 (trace/debug/info/warn/error)，也可以是完整的过滤表达式
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_heartbeat_interval() -> u64 {
    5000
}

fn default_missed_heartbeats() -> u32 {
    3
}

fn default_retain_finished() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_concurrency: None,
            timeout: 0,
            retry: 0,
            heartbeat_interval: default_heartbeat_interval(),
            missed_heartbeats: default_missed_heartbeats(),
            retain_finished: default_retain_finished(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DispatchConfig {
    /// 实际的工作线程数
    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|n| *n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }

    /// 实际的并发上限，每个工作线程同一时间只跑一个执行
    pub fn concurrency(&self) -> usize {
        let workers = self.worker_count();
        self.max_concurrency
            .filter(|n| *n > 0)
            .map_or(workers, |n| n.min(workers))
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval.max(1))
    }

    /// 判定失联的静默时长
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats.max(1)
    }
}

impl EngineConfig {
    /// 从多个源加载配置 (优先级: 环境变量 > 配置文件 > 默认值)
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                tracing::debug!("加载配置文件: {:?}", path);
                Self::load_from_file(&path)?
            }
            None => {
                tracing::debug!("未找到配置文件，使用默认配置");
                Self::default()
            }
        };

        config.apply_env(|name| env::var(name).ok())?;
        Ok(config)
    }

    /// 从指定文件加载配置，再应用环境变量覆盖
    pub fn load_with_file(path: &Path) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env(|name| env::var(name).ok())?;
        Ok(config)
    }

    /// 从指定文件加载配置
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        // 根据文件扩展名选择解析器
        let config = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("解析 TOML 配置失败: {:?}", path))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("解析 YAML 配置失败: {:?}", path))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("解析 JSON 配置失败: {:?}", path))?,
            _ => anyhow::bail!("不支持的配置文件格式: {:?}", path),
        };

        Ok(config)
    }

    /// 查找配置文件 (按优先级搜索)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = env::var("STEPRUN_CONFIG") {
            let p = PathBuf::from(path);
            if p.exists() {
                return Some(p);
            }
        }

        let mut candidates = vec![
            PathBuf::from("./steprun.toml"),
            PathBuf::from("./steprun.yaml"),
            PathBuf::from("./steprun.json"),
        ];
        if let Some(config_dir) = dirs::home_dir().map(|home| home.join(".config/steprun")) {
            candidates.push(config_dir.join("config.toml"));
            candidates.push(config_dir.join("config.yaml"));
        }
        #[cfg(target_os = "linux")]
        candidates.push(PathBuf::from("/etc/steprun/config.toml"));

        candidates.into_iter().find(|path| path.exists())
    }

    /// 用环境变量覆盖配置
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(workers) = lookup("STEPRUN_WORKERS") {
            self.dispatch.workers =
                Some(workers.parse().context("无效的 STEPRUN_WORKERS")?);
        }
        if let Some(limit) = lookup("STEPRUN_MAX_CONCURRENCY") {
            self.dispatch.max_concurrency =
                Some(limit.parse().context("无效的 STEPRUN_MAX_CONCURRENCY")?);
        }
        if let Some(timeout) = lookup("STEPRUN_TIMEOUT") {
            self.dispatch.timeout = timeout.parse().context("无效的 STEPRUN_TIMEOUT")?;
        }
        if let Some(retry) = lookup("STEPRUN_RETRY") {
            self.dispatch.retry = retry.parse().context("无效的 STEPRUN_RETRY")?;
        }
        if let Some(timeout) = lookup("STEPRUN_SCRIPT_TIMEOUT") {
            self.sandbox.timeout = timeout.parse().context("无效的 STEPRUN_SCRIPT_TIMEOUT")?;
        }
        if let Some(level) = lookup("STEPRUN_LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dispatch.timeout(), None);
        assert_eq!(config.dispatch.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.dispatch.heartbeat_deadline(), Duration::from_secs(15));
        assert!(config.dispatch.worker_count() >= 1);
        assert_eq!(config.dispatch.concurrency(), config.dispatch.worker_count());
        assert_eq!(config.sandbox.timeout, 5000);
        assert_eq!(config.dispatch.retain_finished, 16);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_concurrency_never_exceeds_workers() {
        let mut dispatch = DispatchConfig {
            workers: Some(2),
            max_concurrency: Some(5),
            ..Default::default()
        };
        assert_eq!(dispatch.concurrency(), 2);

        dispatch.max_concurrency = Some(1);
        assert_eq!(dispatch.concurrency(), 1);
    }

    #[test]
    fn test_load_toml() {
        let file = write_config(
            ".toml",
            r#"
[dispatch]
workers = 4
max_concurrency = 3
timeout = 30

[sandbox]
timeout = 1000
"#,
        );
        let config = EngineConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.dispatch.worker_count(), 4);
        assert_eq!(config.dispatch.concurrency(), 3);
        assert_eq!(config.dispatch.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.sandbox.timeout, 1000);
        assert_eq!(config.pool.idle_timeout, 300);
    }

    #[test]
    fn test_load_yaml_and_json() {
        let yaml = write_config(".yaml", "dispatch:\n  retry: 2\nlog:\n  level: debug\n");
        let config = EngineConfig::load_from_file(yaml.path()).unwrap();
        assert_eq!(config.dispatch.retry, 2);
        assert_eq!(config.log.level, "debug");

        let json = write_config(".json", r#"{"pool": {"idle_timeout": 60}}"#);
        let config = EngineConfig::load_from_file(json.path()).unwrap();
        assert_eq!(config.pool.idle_timeout, 60);
    }

    #[test]
    fn test_unsupported_format() {
        let file = write_config(".ini", "workers=1");
        assert!(EngineConfig::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let vars: HashMap<&str, &str> = [
            ("STEPRUN_WORKERS", "4"),
            ("STEPRUN_RETRY", "1"),
            ("STEPRUN_SCRIPT_TIMEOUT", "250"),
            ("STEPRUN_LOG_LEVEL", "warn"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config.dispatch.workers = Some(8);
        config
            .apply_env(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.dispatch.worker_count(), 4);
        assert_eq!(config.dispatch.retry, 1);
        assert_eq!(config.sandbox.timeout, 250);
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = EngineConfig::default();
        let result = config.apply_env(|name| (name == "STEPRUN_TIMEOUT").then(|| "soon".to_string()));
        assert!(result.is_err());
    }
}
