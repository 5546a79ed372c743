//! 循环

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use steprun_common::{StepError, StepSpec};

use super::iterate::{iterate, IterationPlan, DEFAULT_INDEX_NAME};
use super::as_count;
use crate::{Controller, StepRuntime};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoopConfig {
    /// 次数，支持 `{{var}}` 模板
    #[serde(default)]
    count: Value,
    #[serde(default, rename = "async")]
    degree: Option<usize>,
    #[serde(default)]
    ignore_error: bool,
    #[serde(default)]
    index_name: Option<String>,
    #[serde(default)]
    interval: u64,
    #[serde(default)]
    continue_on_error: bool,
}

#[derive(Default)]
pub struct LoopStep {
    plan: IterationPlan,
    completed: usize,
    failed: Vec<usize>,
}

impl LoopStep {
    pub fn build(_spec: &StepSpec, _prepared: Value) -> Box<dyn Controller> {
        Box::<Self>::default()
    }
}

#[async_trait]
impl Controller for LoopStep {
    async fn before_execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        let config: LoopConfig = step.config()?;
        let count = if config.count.is_null() {
            1
        } else {
            let rendered = step.scope.render_value(&config.count);
            as_count(&rendered)
                .ok_or_else(|| StepError::system(format!("无效的循环次数: {}", rendered)))?
                as usize
        };

        self.plan = IterationPlan {
            count,
            degree: config.degree.unwrap_or(1).max(1),
            ignore_error: config.ignore_error,
            index_name: config
                .index_name
                .unwrap_or_else(|| DEFAULT_INDEX_NAME.to_string()),
            interval: Duration::from_millis(config.interval),
            continue_on_error: config.continue_on_error,
        };
        Ok(())
    }

    async fn execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        let spec = step.spec;
        let steps = spec.child_groups().first().copied().unwrap_or(&[]);
        if self.plan.count == 0 || steps.is_empty() {
            step.skip();
            return Ok(());
        }

        let outcome = iterate(step, steps, &self.plan, &[]).await;
        self.completed = outcome.completed;
        self.failed = outcome.failed.clone();
        match outcome.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn extra_result(&self) -> Value {
        json!({
            "count": self.plan.count,
            "completed": self.completed,
            "failed": self.failed,
        })
    }
}
