//! StepRun 通用类型定义
//!
//! 此 crate 包含执行器、调度器和命令行之间共享的类型：
//! 错误分类、步骤定义、结果树以及工作线程消息协议。

pub mod codec;
pub mod error;
pub mod message;
pub mod result;
pub mod spec;
pub mod status;

pub use error::{max_severity, ErrorKind, ErrorKindSet, StepError};
pub use message::{CallRequest, QueryTarget, WorkerEvent, WorkerTask};
pub use result::{
    ChildResults, ExecutionResult, LogEntry, LogLevel, NodePath, PathSegment, ResultNode,
};
pub use spec::{
    AssertRule, Assignment, Batch, ChildSteps, Comparator, DataSourceSpec, ExecuteEnv,
    ExecuteMode, ExecuteSpec, InteractSpec, StepSpec, ValueSource, VariableTier,
};
pub use status::{ExecuteStatus, StepFlags, StepState, StepStatus};
