//! 普通分组：按顺序执行全部子步骤

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use steprun_common::{StepError, StepSpec};

use crate::{Controller, StepRuntime};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupConfig {
    #[serde(default)]
    continue_on_error: bool,
}

#[derive(Default)]
pub struct GroupStep {
    failed: Vec<usize>,
}

impl GroupStep {
    pub fn build(_spec: &StepSpec, _prepared: Value) -> Box<dyn Controller> {
        Box::<Self>::default()
    }
}

#[async_trait]
impl Controller for GroupStep {
    async fn execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        let config: GroupConfig = step.config()?;
        let spec = step.spec;
        let groups = spec.child_groups();
        if groups.iter().all(|g| g.is_empty()) {
            step.skip();
            return Ok(());
        }

        // 多个分组视为一个连续序列，失败序号跨分组累计
        let mut errors = Vec::new();
        let mut offset = 0;
        let mut halted = false;
        for (g, steps) in groups.iter().enumerate() {
            if halted {
                step.skip_group(g, steps).await;
                continue;
            }
            let outcome = step
                .run_group(g, steps, step.scope.branch(), config.continue_on_error)
                .await;
            self.failed
                .extend(outcome.failed.iter().map(|i| i + offset));
            errors.extend(outcome.errors);
            offset += steps.len();
            if !self.failed.is_empty() && !config.continue_on_error {
                halted = true;
            }
        }

        if self.failed.is_empty() {
            Ok(())
        } else {
            Err(StepError::combination(self.failed.clone(), &errors))
        }
    }

    fn extra_result(&self) -> Value {
        json!({ "failed": self.failed })
    }
}
