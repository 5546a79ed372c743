//! 单次执行
//!
//! `Execution` 拥有一棵步骤树的全部运行状态；`ExecutionHandle` 可以在
//! 执行过程中并发地查询、取消和投递交互输入。

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use steprun_common::{
    ExecuteEnv, ExecuteSpec, ExecuteStatus, ExecutionResult, NodePath, ResultNode, StepError,
    StepStatus,
};
use tracing::{info, warn};

use crate::driver::{run_group, GroupLocation};
use crate::{EngineServices, EventSink, ExecutionContext, ExecutorError, Result, VariableScope};

/// 单次执行
pub struct Execution {
    exec: Arc<ExecutionContext>,
    spec: ExecuteSpec,
    status: Arc<Mutex<ExecuteStatus>>,
}

impl Execution {
    /// 按执行定义构建初始结果树
    pub fn new(
        services: EngineServices,
        env: Arc<ExecuteEnv>,
        spec: ExecuteSpec,
        events: EventSink,
    ) -> Self {
        let roots = spec
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| services.registry.init_result(step, &NodePath::root(i)))
            .collect();
        let exec = Arc::new(ExecutionContext::new(&spec.id, env, services, events, roots));
        Self {
            exec,
            spec,
            status: Arc::new(Mutex::new(ExecuteStatus::Wait)),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn handle(&self) -> ExecutionHandle {
        ExecutionHandle {
            exec: Arc::clone(&self.exec),
            status: Arc::clone(&self.status),
        }
    }

    fn set_status(&self, status: ExecuteStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// 执行全部顶层步骤
    ///
    /// 顶层步骤顺序执行，任何一个失败后其余步骤跳过。
    pub async fn run(self) -> ExecutionResult {
        let started = Instant::now();
        let exec = Arc::clone(&self.exec);
        info!(
            "开始执行 {} ({} 个顶层步骤)",
            self.spec.name.as_deref().unwrap_or(&self.spec.id),
            self.spec.steps.len()
        );
        self.set_status(ExecuteStatus::Running);

        let scope = VariableScope::new(self.spec.variables.clone(), exec.env.variables.clone());
        let outcome = run_group(
            Arc::clone(&exec),
            GroupLocation::Root,
            &self.spec.steps,
            scope,
            false,
        )
        .await;

        let cancelled = exec.is_cancelled();
        if cancelled {
            let error = StepError::general("执行已取消");
            for i in 0..self.spec.steps.len() {
                exec.tree.settle(&NodePath::root(i), &error).await;
            }
        }

        let status = if cancelled {
            ExecuteStatus::Cancelled
        } else if outcome.status == StepStatus::Error {
            ExecuteStatus::Error
        } else {
            ExecuteStatus::Done
        };
        self.set_status(status);

        let details: BTreeMap<String, Value> = exec.drain_details().into_iter().collect();
        let mut result = ExecutionResult::new(&self.spec.id);
        result.status = status;
        result.total_time = started.elapsed().as_millis() as u64;
        result.steps = exec.tree.snapshot().await;
        result.details = details;
        result.error = outcome.error();

        match status {
            ExecuteStatus::Done => info!("执行 {} 完成 ({}ms)", self.spec.id, result.total_time),
            _ => warn!("执行 {} 结束: {} ({}ms)", self.spec.id, status, result.total_time),
        }
        result
    }
}

/// 运行中执行的控制句柄
#[derive(Clone)]
pub struct ExecutionHandle {
    exec: Arc<ExecutionContext>,
    status: Arc<Mutex<ExecuteStatus>>,
}

impl ExecutionHandle {
    pub fn execute_id(&self) -> &str {
        &self.exec.execute_id
    }

    pub fn status(&self) -> ExecuteStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 协作式取消，可重复调用
    pub fn cancel(&self) {
        if !self.exec.cancel.is_cancelled() {
            info!("取消执行 {}", self.exec.execute_id);
            self.exec.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.exec.is_cancelled()
    }

    /// 结果树快照
    pub async fn query_tree(&self) -> Vec<ResultNode> {
        self.exec.tree.snapshot().await
    }

    /// 单个步骤详情 (节点路径或步骤 ID)
    pub async fn query_detail(&self, node: &str) -> Result<Value> {
        let path = self
            .exec
            .tree
            .find(node)
            .await
            .ok_or_else(|| ExecutorError::NodeNotFound(node.to_string()))?;
        let snapshot = self
            .exec
            .tree
            .node(&path)
            .await
            .ok_or_else(|| ExecutorError::NodeNotFound(node.to_string()))?;
        let detail = self.exec.detail(&path.to_string()).unwrap_or(Value::Null);
        Ok(json!({
            "key": snapshot.key,
            "id": snapshot.id,
            "status": snapshot.status,
            "extra": snapshot.extra,
            "detail": detail,
        }))
    }

    /// 向等待交互的步骤投递输入
    pub fn interact(&self, node: &str, answer: Value) -> Result<()> {
        self.exec.interactions.answer(node, answer)
    }

    /// 正在等待交互的节点
    pub fn pending_interactions(&self) -> Vec<String> {
        self.exec.interactions.pending()
    }
}
