//! StepRun 脚本沙箱
//!
//! 基于 rhai 运行前置/后置脚本和条件表达式：
//! - 注入 `ctx` (变量读写、环境变量、sleep、外部进程) 和 `console` 对象
//! - 每段脚本都有硬超时，不让出执行权的死循环同样会在超时点被中止
//! - 只允许导入白名单模块和环境中声明的共享脚本
//! - 控制台输出经去环处理后写入结果树

pub mod config;
pub mod console;
pub mod context;
pub mod decycle;
pub mod engine;
pub mod modules;

pub use config::SandboxConfig;
pub use console::{Console, LogSink};
pub use context::{ScriptBindings, SharedVariables};
pub use decycle::{json_to_dynamic, to_json};
pub use engine::{ScriptRequest, ScriptRun, ScriptSandbox};

use thiserror::Error;

/// 沙箱错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    #[error("脚本执行超时 ({0}ms)")]
    Timeout(u64),

    #[error("{}", locate(.message, .line, .column))]
    Script {
        message: String,
        line: Option<usize>,
        column: Option<usize>,
        stack: Option<String>,
    },

    #[error("找不到模块: {0}")]
    ModuleNotFound(String),

    #[error("脚本已取消")]
    Cancelled,

    #[error("脚本沙箱已关闭")]
    Shutdown,

    #[error("脚本运行异常: {0}")]
    Internal(String),
}

impl SandboxError {
    /// 脚本调用栈
    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Script { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

fn locate(message: &str, line: &Option<usize>, column: &Option<usize>) -> String {
    match (line, column) {
        (Some(line), Some(column)) => format!("{} (line {}, column {})", message, line, column),
        (Some(line), None) => format!("{} (line {})", message, line),
        _ => message.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_location() {
        let error = SandboxError::Script {
            message: "变量未定义: x".to_string(),
            line: Some(3),
            column: Some(5),
            stack: None,
        };
        assert_eq!(error.to_string(), "变量未定义: x (line 3, column 5)");
    }
}
