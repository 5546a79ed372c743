//! StepRun 执行器
//!
//! 把步骤定义实例化为控制器树并驱动执行：
//! 单步骤按 INIT→PRE→EXECUTE→POST→ASSIGNMENT→ASSERT→DONE 推进，
//! 组合步骤通过同一个子步骤执行原语递归驱动子控制器。

pub mod context;
pub mod controller;
pub mod driver;
pub mod execution;
pub mod interact;
pub mod registry;
pub mod rules;
pub mod steps;
pub mod tree;
pub mod variables;

pub use context::{EngineServices, EventSink, ExecutionContext};
pub use controller::{Controller, ControllerFactory, FnFactory, StepRuntime};
pub use driver::{GroupLocation, GroupOutcome, StepOutcome, DEFAULT_INTERACT_VARIABLE};
pub use execution::{Execution, ExecutionHandle};
pub use interact::InteractHub;
pub use registry::ControllerRegistry;
pub use tree::{NodeProgress, ResultTree};
pub use variables::{lookup_path, VariableScope};

use thiserror::Error;

/// 执行器错误
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("步骤 {0} 不在交互状态")]
    NotInteracting(String),

    #[error("节点 {0} 不存在")]
    NodeNotFound(String),

    #[error("步骤类型 {0} 已注册")]
    AlreadyRegistered(String),

    #[error("编解码错误: {0}")]
    Codec(#[from] steprun_common::codec::CodecError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
