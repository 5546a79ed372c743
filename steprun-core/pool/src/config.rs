//! 资源池配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 资源池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 连接空闲超时（秒）
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// 空闲检查间隔（秒）
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }
}

// 默认值函数
fn default_idle_timeout() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    20
}
