//! 生命周期驱动
//!
//! `run_step` 把一个节点从 INIT 推进到 DONE；`run_group` 是所有组合步骤
//! 共用的子步骤执行原语：顺序执行、作用域向后传递、失败后跳过剩余兄弟节点。

use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use steprun_common::{
    ErrorKind, InteractSpec, NodePath, StepError, StepSpec, StepState, StepStatus,
};
use tracing::{debug, info, warn};

use crate::rules::{apply_assignments, check_asserts};
use crate::{ExecutionContext, StepRuntime, VariableScope};

/// 交互输入默认写入的变量
pub const DEFAULT_INTERACT_VARIABLE: &str = "_interact";

/// 子步骤分组所在位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupLocation {
    /// 顶层步骤
    Root,
    /// 父节点的第 `group` 个分组
    Child { parent: NodePath, group: usize },
}

impl GroupLocation {
    pub fn path(&self, index: usize) -> NodePath {
        match self {
            Self::Root => NodePath::root(index),
            Self::Child { parent, group } => parent.child(*group, index),
        }
    }
}

/// 单个步骤的执行结果
#[derive(Debug)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub errors: Vec<StepError>,
    /// 步骤结束后的作用域 (传给下一个兄弟节点)
    pub scope: VariableScope,
}

/// 一组子步骤的执行结果
#[derive(Debug)]
pub struct GroupOutcome {
    pub status: StepStatus,
    /// 失败子步骤的序号 (1 起始)
    pub failed: Vec<usize>,
    /// 失败子步骤的错误
    pub errors: Vec<StepError>,
    /// 最后一个子步骤结束后的作用域
    pub scope: VariableScope,
}

impl GroupOutcome {
    pub fn is_error(&self) -> bool {
        self.status == StepStatus::Error
    }

    /// 包装为组合错误
    pub fn error(&self) -> Option<StepError> {
        self.is_error()
            .then(|| StepError::combination(self.failed.clone(), &self.errors))
    }
}

/// 顺序执行一组步骤
pub async fn run_group(
    exec: Arc<ExecutionContext>,
    location: GroupLocation,
    steps: &[StepSpec],
    scope: VariableScope,
    continue_on_error: bool,
) -> GroupOutcome {
    if let GroupLocation::Child { parent, group } = &location {
        let nodes = exec.services.registry.init_group(steps, parent, *group);
        exec.tree.set_group(parent, *group, nodes).await;
    }

    let mut scope = scope;
    let mut failed = Vec::new();
    let mut errors = Vec::new();
    let mut halted = false;
    let mut completed = false;

    for (i, spec) in steps.iter().enumerate() {
        let path = location.path(i);
        if halted {
            exec.skip(&path).await;
            continue;
        }

        let outcome = run_step(Arc::clone(&exec), spec, path, scope).await;
        scope = outcome.scope;
        match outcome.status {
            StepStatus::Error => {
                failed.push(i + 1);
                errors.extend(outcome.errors);
                if !continue_on_error {
                    halted = true;
                }
            }
            StepStatus::Done => completed = true,
            _ => {}
        }
    }

    let status = if !failed.is_empty() {
        StepStatus::Error
    } else if completed {
        StepStatus::Done
    } else {
        StepStatus::Skip
    };

    GroupOutcome {
        status,
        failed,
        errors,
        scope,
    }
}

/// 生成分组节点并全部标记为跳过
pub async fn skip_group(exec: &ExecutionContext, location: &GroupLocation, steps: &[StepSpec]) {
    if let GroupLocation::Child { parent, group } = location {
        let nodes = exec.services.registry.init_group(steps, parent, *group);
        exec.tree.set_group(parent, *group, nodes).await;
    }
    for i in 0..steps.len() {
        exec.skip(&location.path(i)).await;
    }
}

/// 执行单个步骤的完整生命周期
pub fn run_step<'a>(
    exec: Arc<ExecutionContext>,
    spec: &'a StepSpec,
    path: NodePath,
    scope: VariableScope,
) -> BoxFuture<'a, StepOutcome> {
    async move {
        if spec.flag.is_disabled() || exec.is_cancelled() {
            debug!("跳过步骤 {} ({})", spec.id, path);
            exec.skip(&path).await;
            return StepOutcome {
                status: StepStatus::Skip,
                errors: Vec::new(),
                scope,
            };
        }

        let started = Instant::now();
        exec.update(&path, |node| {
            node.status = StepStatus::Running;
            node.state = StepState::Init;
        })
        .await;
        debug!("开始执行步骤 {} [{}] ({})", spec.display_name(), spec.step_type, path);

        let mut step = StepRuntime::new(spec, path.clone(), scope, Arc::clone(&exec));
        let mut errors = Vec::new();
        let mut extra = Value::Null;

        let factory = exec.services.registry.factory(&spec.step_type);
        match factory.prepare(spec, &exec).await {
            Ok(prepared) => {
                let mut controller = factory.create(spec, prepared);
                drive(controller.as_mut(), &mut step, &mut errors).await;
                extra = controller.extra_result();
                if errors.is_empty() || (spec.ignore_error && only_execute_failed(&errors)) {
                    finalize(&mut step, &extra, &mut errors).await;
                }
                exec.retire(path.to_string(), controller);
            }
            Err(e) => errors.push(e.reclassify(ErrorKind::System)),
        }

        let status = if !errors.is_empty() {
            StepStatus::Error
        } else if step.is_skipped() {
            StepStatus::Skip
        } else {
            StepStatus::Done
        };
        let total_time = started.elapsed().as_millis() as u64;

        if status == StepStatus::Error {
            warn!(
                "步骤 {} ({}) 执行失败: {}",
                spec.display_name(),
                path,
                errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
            );
        } else {
            debug!("步骤 {} ({}) 结束: {} ({}ms)", spec.display_name(), path, status, total_time);
        }

        let node_errors = errors.clone();
        exec.update(&path, move |node| {
            node.status = status;
            node.state = StepState::Done;
            node.errors = node_errors;
            node.extra = extra;
            node.total_time = total_time;
        })
        .await;

        StepOutcome {
            status,
            errors,
            scope: step.scope,
        }
    }
    .boxed()
}

/// INIT → PRE → (INTERACT) → EXECUTE，以及总会执行的收尾
async fn drive(
    controller: &mut dyn crate::Controller,
    step: &mut StepRuntime<'_>,
    errors: &mut Vec<StepError>,
) {
    let spec = step.spec;

    if let Err(e) = controller.before_execute(step).await {
        errors.push(e.reclassify(ErrorKind::System));
    }

    if errors.is_empty() {
        enter(step, StepState::Pre).await;
        if let Some(source) = &spec.pre_script {
            if let Err(e) = step.run_script(source, ErrorKind::Pre, Vec::new()).await {
                errors.push(e);
            }
        }
    }

    if errors.is_empty() {
        if let Some(interact) = &spec.interact {
            if let Err(e) = await_interaction(step, interact).await {
                errors.push(e);
            }
        }
    }

    if errors.is_empty() {
        enter(step, StepState::Execute).await;
        let result = match spec.timeout {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), controller.execute(step)).await {
                    Ok(result) => result,
                    Err(_) => Err(StepError::timeout(ErrorKind::Execute, ms)),
                }
            }
            None => controller.execute(step).await,
        };
        if let Err(e) = result {
            errors.push(e);
        }
    }

    if let Err(e) = controller.after_execute(step).await {
        errors.push(e.reclassify(ErrorKind::System));
    }
}

/// POST → ASSIGNMENT → ASSERT
async fn finalize(step: &mut StepRuntime<'_>, extra: &Value, errors: &mut Vec<StepError>) {
    let spec = step.spec;

    enter(step, StepState::Post).await;
    if let Some(source) = &spec.post_script {
        let constants = vec![("result".to_string(), extra.clone())];
        if let Err(e) = step.run_script(source, ErrorKind::Post, constants).await {
            errors.push(e);
            return;
        }
    }

    enter(step, StepState::Assignment).await;
    if let Err(e) = apply_assignments(&spec.assignment, extra, &mut step.scope) {
        errors.push(e);
        return;
    }

    enter(step, StepState::Assert).await;
    errors.extend(check_asserts(&spec.asserts, extra, &step.scope));
}

/// 失败只来自 EXECUTE 阶段
fn only_execute_failed(errors: &[StepError]) -> bool {
    errors.iter().all(|e| {
        !matches!(
            e.kind,
            ErrorKind::System | ErrorKind::Pre | ErrorKind::Interact
        )
    })
}

async fn enter(step: &StepRuntime<'_>, state: StepState) {
    step.exec.tree.update(&step.path, |node| node.state = state).await;
}

/// 挂起等待用户输入，直到收到应答、超时或执行被取消
async fn await_interaction(step: &mut StepRuntime<'_>, interact: &InteractSpec) -> Result<(), StepError> {
    let exec = Arc::clone(&step.exec);
    let key = step.path.to_string();
    let receiver = exec.interactions.wait(&key, &step.spec.id);

    let prompt = json!({
        "message": step.scope.render(&interact.message),
        "fields": interact.fields,
    });
    if let Some(progress) = exec
        .tree
        .update(&step.path, |node| node.status = StepStatus::Interact)
        .await
    {
        exec.events.progress(progress, Some(prompt));
    }
    info!("步骤 {} ({}) 等待用户交互", step.spec.display_name(), key);

    let wait = async {
        match interact.timeout {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), receiver)
                .await
                .map_err(|_| StepError::timeout(ErrorKind::Interact, ms)),
            None => Ok(receiver.await),
        }
    };
    let received = tokio::select! {
        received = wait => received,
        _ = exec.cancel.cancelled() => Err(StepError::interact("等待交互时执行被取消")),
    };

    exec.interactions.withdraw(&key);
    exec.update(&step.path, |node| node.status = StepStatus::Running)
        .await;

    let answer = received?.map_err(|_| StepError::interact("交互通道已关闭"))?;
    let value = accept(answer)?;
    let variable = interact
        .variable
        .as_deref()
        .unwrap_or(DEFAULT_INTERACT_VARIABLE);
    step.scope.set(variable, value);
    Ok(())
}

/// 解析应答：`{"accept": false}` 表示拒绝，`{"value": x}` 取出 x，其余原样使用
fn accept(answer: Value) -> Result<Value, StepError> {
    match answer {
        Value::Object(mut map) => {
            if map.get("accept") == Some(&Value::Bool(false)) {
                let reason = map
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("用户拒绝了交互")
                    .to_string();
                return Err(StepError::interact(reason));
            }
            match map.remove("value") {
                Some(value) => Ok(value),
                None => Ok(Value::Object(map)),
            }
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_answer() {
        assert_eq!(accept(json!({"value": 3, "accept": true})).unwrap(), json!(3));
        assert_eq!(accept(json!("yes")).unwrap(), json!("yes"));
        assert_eq!(accept(json!({"a": 1})).unwrap(), json!({"a": 1}));

        let rejected = accept(json!({"accept": false, "reason": "不同意"})).unwrap_err();
        assert_eq!(rejected.kind, ErrorKind::Interact);
        assert_eq!(rejected.message, "不同意");
    }

    #[test]
    fn test_group_location_paths() {
        assert_eq!(GroupLocation::Root.path(2).to_string(), "2");
        let child = GroupLocation::Child {
            parent: NodePath::root(1),
            group: 1,
        };
        assert_eq!(child.path(0).to_string(), "1/1.0");
    }

    #[test]
    fn test_only_execute_failed() {
        assert!(only_execute_failed(&[StepError::execute("x")]));
        assert!(only_execute_failed(&[StepError::timeout(ErrorKind::Execute, 10)]));
        assert!(!only_execute_failed(&[
            StepError::execute("x"),
            StepError::system("after")
        ]));
    }
}
