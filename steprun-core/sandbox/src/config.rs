//! 沙箱配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 脚本沙箱配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// 单段脚本超时（毫秒）
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// 最大函数调用深度
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,

    /// 单段脚本最多加载的模块数
    #[serde(default = "default_max_modules")]
    pub max_modules: usize,

    /// 是否允许 ctx.exec / ctx.spawn 启动外部进程
    #[serde(default = "default_allow_process")]
    pub allow_process: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_call_levels: default_max_call_levels(),
            max_modules: default_max_modules(),
            allow_process: default_allow_process(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = timeout_ms;
        self
    }
}

fn default_timeout() -> u64 {
    5000
}

fn default_max_call_levels() -> usize {
    64
}

fn default_max_modules() -> usize {
    16
}

fn default_allow_process() -> bool {
    true
}
