//! 迭代执行 (loop / dataset 共用)
//!
//! 每次迭代都从父作用域复制一份新的作用域并注入迭代序号，子节点写在
//! 第 `i` 个分组下。并发度大于 1 时用 `buffer_unordered` 限制同时运行的迭代数。

use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use steprun_common::{StepError, StepSpec};
use tracing::debug;

use crate::{GroupOutcome, StepRuntime};

/// 默认迭代序号变量名
pub const DEFAULT_INDEX_NAME: &str = "_index";

/// 迭代参数
#[derive(Debug, Clone)]
pub struct IterationPlan {
    pub count: usize,
    /// 并发度 (1 为顺序执行)
    pub degree: usize,
    /// 迭代失败后继续后续迭代
    pub ignore_error: bool,
    pub index_name: String,
    /// 顺序执行时两次迭代之间的间隔
    pub interval: Duration,
    /// 迭代内子步骤失败后继续执行同组后续步骤
    pub continue_on_error: bool,
}

impl Default for IterationPlan {
    fn default() -> Self {
        Self {
            count: 1,
            degree: 1,
            ignore_error: false,
            index_name: DEFAULT_INDEX_NAME.to_string(),
            interval: Duration::ZERO,
            continue_on_error: false,
        }
    }
}

/// 迭代结果
#[derive(Debug, Default)]
pub struct IterationOutcome {
    /// 实际执行的迭代数
    pub completed: usize,
    /// 失败迭代的序号 (1 起始，升序)
    pub failed: Vec<usize>,
    pub errors: Vec<StepError>,
    pub cancelled: bool,
}

impl IterationOutcome {
    pub fn error(&self) -> Option<StepError> {
        (!self.failed.is_empty()).then(|| StepError::combination(self.failed.clone(), &self.errors))
    }

    fn record(&mut self, index: usize, group: GroupOutcome) {
        self.completed += 1;
        if group.is_error() {
            self.failed.push(index + 1);
            self.errors.extend(group.errors);
        }
    }
}

/// 按计划执行迭代，`rows` 非空时第 `i` 行的字段注入第 `i` 次迭代的作用域
pub async fn iterate(
    step: &StepRuntime<'_>,
    steps: &[StepSpec],
    plan: &IterationPlan,
    rows: &[Map<String, Value>],
) -> IterationOutcome {
    if plan.degree <= 1 {
        sequential(step, steps, plan, rows).await
    } else {
        concurrent(step, steps, plan, rows).await
    }
}

async fn sequential(
    step: &StepRuntime<'_>,
    steps: &[StepSpec],
    plan: &IterationPlan,
    rows: &[Map<String, Value>],
) -> IterationOutcome {
    let mut outcome = IterationOutcome::default();
    for i in 0..plan.count {
        if step.is_cancelled() || (i > 0 && !pause(step, plan.interval).await) {
            outcome.cancelled = true;
            break;
        }
        let group = run_iteration(step, steps, plan, rows, i).await;
        let failed = group.is_error();
        outcome.record(i, group);
        if failed && !plan.ignore_error {
            debug!("步骤 {} 第 {} 次迭代失败，停止迭代", step.spec.id, i + 1);
            break;
        }
    }
    outcome
}

async fn concurrent(
    step: &StepRuntime<'_>,
    steps: &[StepSpec],
    plan: &IterationPlan,
    rows: &[Map<String, Value>],
) -> IterationOutcome {
    let halted = AtomicBool::new(false);
    let halted = &halted;
    let mut results: Vec<(usize, GroupOutcome)> = stream::iter(0..plan.count)
        .map(|i| async move {
            if halted.load(Ordering::SeqCst) || step.is_cancelled() {
                return None;
            }
            let group = run_iteration(step, steps, plan, rows, i).await;
            if group.is_error() && !plan.ignore_error {
                halted.store(true, Ordering::SeqCst);
            }
            Some((i, group))
        })
        .buffer_unordered(plan.degree)
        .filter_map(|result| async move { result })
        .collect()
        .await;
    results.sort_by_key(|(i, _)| *i);

    let mut outcome = IterationOutcome {
        cancelled: step.is_cancelled(),
        ..Default::default()
    };
    for (i, group) in results {
        outcome.record(i, group);
    }
    outcome
}

async fn run_iteration(
    step: &StepRuntime<'_>,
    steps: &[StepSpec],
    plan: &IterationPlan,
    rows: &[Map<String, Value>],
    index: usize,
) -> GroupOutcome {
    let mut scope = step.scope.branch();
    scope.set(&plan.index_name, json!(index));
    if let Some(row) = rows.get(index) {
        for (name, value) in row {
            scope.set(name, value.clone());
        }
    }
    step.run_group(index, steps, scope, plan.continue_on_error).await
}

/// 等待指定时间，期间被取消时返回 false
pub(crate) async fn pause(step: &StepRuntime<'_>, duration: Duration) -> bool {
    if duration.is_zero() {
        return !step.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = step.exec.cancel.cancelled() => false,
    }
}
