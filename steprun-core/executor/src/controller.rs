//! 控制器契约
//!
//! 每种步骤类型提供一个 [`ControllerFactory`]，执行时为每个节点创建一个
//! [`Controller`]。生命周期由驱动器统一推进，控制器只负责三个钩子。

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use steprun_common::{ErrorKind, LogEntry, NodePath, ResultNode, StepError, StepSpec};
use steprun_sandbox::{LogSink, SandboxError, ScriptRequest};

use crate::driver::{self, GroupLocation, GroupOutcome};
use crate::{ExecutionContext, VariableScope};

/// 步骤控制器
#[async_trait]
pub trait Controller: Send {
    /// 执行前准备 (解析模板、校验配置)，失败记为系统错误
    async fn before_execute(&mut self, _step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        Ok(())
    }

    /// 步骤动作本身，组合步骤在这里驱动子步骤
    async fn execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError>;

    /// 收尾，总会执行
    async fn after_execute(&mut self, _step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        Ok(())
    }

    /// 结果摘要，写入结果树并作为后置脚本的 `result`
    fn extra_result(&self) -> Value {
        Value::Null
    }

    /// 完整结果，按需查询
    fn detail_result(&self) -> Value {
        Value::Null
    }
}

/// 控制器工厂
#[async_trait]
pub trait ControllerFactory: Send + Sync {
    fn step_type(&self) -> &str;

    /// 实例化前的准备 (例如预读上传的文件)，结果传给 `create`
    async fn prepare(&self, _spec: &StepSpec, _exec: &ExecutionContext) -> Result<Value, StepError> {
        Ok(Value::Null)
    }

    fn create(&self, spec: &StepSpec, prepared: Value) -> Box<dyn Controller>;

    /// 初始结果节点，默认按步骤定义的形状展开子节点
    fn create_init_result(&self, base: ResultNode, _spec: &StepSpec) -> ResultNode {
        base
    }
}

type BuildFn = fn(&StepSpec, Value) -> Box<dyn Controller>;

/// 由构造函数组成的工厂
pub struct FnFactory {
    step_type: String,
    build: BuildFn,
    iterative: bool,
}

impl FnFactory {
    pub fn new(step_type: &str, build: BuildFn) -> Self {
        Self {
            step_type: step_type.to_string(),
            build,
            iterative: false,
        }
    }

    /// 子节点在执行时按迭代生成，初始结果只带空分组
    pub fn iterative(mut self) -> Self {
        self.iterative = true;
        self
    }
}

#[async_trait]
impl ControllerFactory for FnFactory {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn create(&self, spec: &StepSpec, prepared: Value) -> Box<dyn Controller> {
        (self.build)(spec, prepared)
    }

    fn create_init_result(&self, mut base: ResultNode, _spec: &StepSpec) -> ResultNode {
        if self.iterative {
            base.children = Some(steprun_common::ChildResults::Groups(Vec::new()));
        }
        base
    }
}

/// 控制器执行时可用的运行环境
pub struct StepRuntime<'a> {
    pub spec: &'a StepSpec,
    pub path: NodePath,
    pub scope: VariableScope,
    pub exec: Arc<ExecutionContext>,
    skipped: bool,
}

impl<'a> StepRuntime<'a> {
    pub fn new(
        spec: &'a StepSpec,
        path: NodePath,
        scope: VariableScope,
        exec: Arc<ExecutionContext>,
    ) -> Self {
        Self {
            spec,
            path,
            scope,
            exec,
            skipped: false,
        }
    }

    /// 按类型解析步骤配置
    pub fn config<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        let config = if self.spec.config.is_null() {
            Value::Object(Default::default())
        } else {
            self.spec.config.clone()
        };
        serde_json::from_value(config).map_err(|e| {
            StepError::system(format!("步骤 {} 配置无效: {}", self.spec.id, e))
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.exec.is_cancelled()
    }

    /// 步骤以 SKIP 结束 (没有错误时生效)
    pub fn skip(&mut self) {
        self.skipped = true;
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    /// 在当前作用域中运行脚本，上下文变量写回当前作用域
    pub async fn run_script(
        &mut self,
        source: &str,
        kind: ErrorKind,
        constants: Vec<(String, Value)>,
    ) -> Result<Value, StepError> {
        let mut scope = self.scope.clone();
        let result = self.run_script_in(source, kind, constants, &mut scope).await;
        self.scope = scope;
        result
    }

    /// 在指定作用域中运行脚本
    pub async fn run_script_in(
        &self,
        source: &str,
        kind: ErrorKind,
        constants: Vec<(String, Value)>,
        scope: &mut VariableScope,
    ) -> Result<Value, StepError> {
        let events = self.exec.events.clone();
        let sink_key = self.path.to_string();
        let sink: LogSink = Arc::new(move |entry: &LogEntry| events.log(&sink_key, entry.clone()));

        let mut request = ScriptRequest::new(scope.to_bindings())
            .with_modules(self.exec.modules())
            .with_timeout(self.spec.script_timeout.map(Duration::from_millis))
            .with_cancel(self.exec.cancel.child_token())
            .with_log_sink(sink);
        for (name, value) in constants {
            request = request.with_constant(&name, value);
        }

        let run = self.exec.services.sandbox.run(source, request).await;
        scope.apply_context(run.context);
        if !run.logs.is_empty() {
            let logs = run.logs;
            self.exec
                .tree
                .update(&self.path, move |node| node.logs.extend(logs))
                .await;
        }

        run.result.map_err(|e| script_error(kind, e))
    }

    /// 运行一组子步骤，子节点写在本节点的第 `group` 个分组下
    pub async fn run_group(
        &self,
        group: usize,
        steps: &[StepSpec],
        scope: VariableScope,
        continue_on_error: bool,
    ) -> GroupOutcome {
        let location = GroupLocation::Child {
            parent: self.path.clone(),
            group,
        };
        driver::run_group(Arc::clone(&self.exec), location, steps, scope, continue_on_error).await
    }

    /// 不执行的分组：生成节点并全部标记为跳过
    pub async fn skip_group(&self, group: usize, steps: &[StepSpec]) {
        let location = GroupLocation::Child {
            parent: self.path.clone(),
            group,
        };
        driver::skip_group(&self.exec, &location, steps).await;
    }
}

fn script_error(kind: ErrorKind, error: SandboxError) -> StepError {
    match error {
        SandboxError::Timeout(ms) => StepError::timeout(kind, ms),
        SandboxError::Script { ref stack, .. } => {
            let stack = stack.clone();
            let step_error = StepError::new(kind, error.to_string());
            match stack {
                Some(stack) => step_error.with_stack(stack),
                None => step_error,
            }
        }
        SandboxError::Shutdown | SandboxError::Internal(_) => StepError::system(error.to_string()),
        other => StepError::new(kind, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_mapping() {
        let timeout = script_error(ErrorKind::Pre, SandboxError::Timeout(50));
        assert_eq!(timeout.kind, ErrorKind::Pre);
        assert!(timeout.is_timeout());

        let script = script_error(
            ErrorKind::Post,
            SandboxError::Script {
                message: "boom".to_string(),
                line: Some(2),
                column: Some(1),
                stack: Some("at f (line 2)".to_string()),
            },
        );
        assert_eq!(script.kind, ErrorKind::Post);
        assert_eq!(script.message, "boom (line 2, column 1)");
        assert_eq!(script.stack.as_deref(), Some("at f (line 2)"));

        let missing = script_error(ErrorKind::Pre, SandboxError::ModuleNotFound("fs".into()));
        assert_eq!(missing.kind, ErrorKind::Pre);
        assert!(missing.message.contains("fs"));

        assert_eq!(
            script_error(ErrorKind::Pre, SandboxError::Shutdown).kind,
            ErrorKind::System
        );
    }
}
