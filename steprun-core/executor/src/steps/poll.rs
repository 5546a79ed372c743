//! 轮询
//!
//! 反复执行子步骤直到满足条件。命中 `breakError` 的错误立即结束轮询，
//! 其余错误视为本次未满足条件。

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use steprun_common::{ErrorKind, ErrorKindSet, StepError, StepSpec};
use tracing::debug;

use super::iterate::{pause, DEFAULT_INDEX_NAME};
use super::truthy;
use crate::{Controller, StepRuntime};

fn default_max_count() -> usize {
    10
}

fn default_interval() -> u64 {
    1000
}

fn default_break_error() -> ErrorKindSet {
    ErrorKindSet::at_least(ErrorKind::System.severity())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollConfig {
    #[serde(default = "default_max_count")]
    max_count: usize,
    /// 两次轮询之间的间隔 (毫秒)
    #[serde(default = "default_interval")]
    interval: u64,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default = "default_break_error")]
    break_error: ErrorKindSet,
    #[serde(default)]
    index_name: Option<String>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_count: default_max_count(),
            interval: default_interval(),
            condition: None,
            break_error: default_break_error(),
            index_name: None,
        }
    }
}

/// 错误是否命中中断集合
///
/// 组合错误按其严重级别匹配集合中同级别的类别。
fn breaks(errors: &[StepError], set: ErrorKindSet) -> bool {
    errors.iter().any(|error| {
        set.contains(error.kind)
            || (error.kind == ErrorKind::Combination
                && set
                    .iter()
                    .any(|kind| kind != ErrorKind::Combination && kind.severity() == error.severity))
    })
}

#[derive(Default)]
pub struct PollStep {
    config: PollConfig,
    attempts: usize,
    success: bool,
}

impl PollStep {
    pub fn build(_spec: &StepSpec, _prepared: Value) -> Box<dyn Controller> {
        Box::<Self>::default()
    }
}

#[async_trait]
impl Controller for PollStep {
    async fn before_execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        self.config = step.config()?;
        if self.config.max_count == 0 {
            return Err(StepError::system("轮询次数必须大于 0"));
        }
        Ok(())
    }

    async fn execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        let spec = step.spec;
        let steps = spec.child_groups().first().copied().unwrap_or(&[]);
        let interval = Duration::from_millis(self.config.interval);
        let index_name = self
            .config
            .index_name
            .clone()
            .unwrap_or_else(|| DEFAULT_INDEX_NAME.to_string());

        for attempt in 0..self.config.max_count {
            if step.is_cancelled() || (attempt > 0 && !pause(step, interval).await) {
                return Err(StepError::general("轮询被取消"));
            }
            self.attempts = attempt + 1;

            let mut scope = step.scope.branch();
            scope.set(&index_name, json!(attempt));
            let outcome = step.run_group(attempt, steps, scope, false).await;

            if outcome.is_error() {
                if breaks(&outcome.errors, self.config.break_error) {
                    return Err(StepError::combination(vec![attempt + 1], &outcome.errors));
                }
                debug!("轮询 {} 第 {} 次失败，继续", spec.id, attempt + 1);
                continue;
            }

            let satisfied = match &self.config.condition {
                None => true,
                Some(condition) => {
                    let mut scope = outcome.scope;
                    let value = step
                        .run_script_in(condition, ErrorKind::Execute, Vec::new(), &mut scope)
                        .await?;
                    truthy(&value)
                }
            };
            if satisfied {
                self.success = true;
                return Ok(());
            }
        }

        Err(StepError::execute(format!(
            "轮询 {} 次后仍未满足条件",
            self.config.max_count
        )))
    }

    fn extra_result(&self) -> Value {
        json!({
            "attempts": self.attempts,
            "success": self.success,
        })
    }
}
