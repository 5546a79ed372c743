//! StepRun 调度层
//!
//! 每个执行运行在独立的工作线程中 (各自的单线程运行时、脚本沙箱和资源池)，
//! 调度器与工作线程之间只通过 `WorkerTask` / `WorkerEvent` 消息通信。

pub mod batch;
pub mod config;
pub mod worker;

pub use batch::{BatchRun, BatchSummary, DispatchHandle, Dispatcher, ExecutionReport, SummaryEntry};
pub use config::{DispatchConfig, EngineConfig, LogConfig};
pub use worker::{default_services, WorkerSetup};

use steprun_common::codec::CodecError;
use steprun_common::StepError;
use thiserror::Error;

/// 调度错误
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("启动工作线程失败: {0}")]
    WorkerSpawn(String),

    #[error("工作线程 {0} 已退出")]
    WorkerGone(usize),

    #[error("执行 {0} 不在运行中")]
    NotRunning(String),

    #[error("请求失败: {0}")]
    Request(StepError),

    #[error("调度器已关闭")]
    Closed,

    #[error("编解码错误: {0}")]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
