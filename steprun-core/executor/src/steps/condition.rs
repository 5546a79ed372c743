//! 条件分支
//!
//! 条件脚本只求值一次：真值执行第 0 组，假值执行第 1 组，另一组的节点
//! 依然写入结果树并标记为跳过。

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use steprun_common::{ErrorKind, StepError, StepSpec, StepStatus};
use tracing::debug;

use super::truthy;
use crate::{Controller, StepRuntime};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConditionConfig {
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    continue_on_error: bool,
}

#[derive(Default)]
pub struct ConditionStep {
    config: ConditionConfig,
    result: Option<[bool; 2]>,
}

impl ConditionStep {
    pub fn build(_spec: &StepSpec, _prepared: Value) -> Box<dyn Controller> {
        Box::<Self>::default()
    }
}

#[async_trait]
impl Controller for ConditionStep {
    async fn before_execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        self.config = step.config()?;
        let groups = step.spec.child_groups();
        if groups.len() > 2 {
            return Err(StepError::system(format!(
                "条件步骤 {} 最多两个分支，实际 {} 个",
                step.spec.id,
                groups.len()
            )));
        }
        let has_steps = groups.iter().any(|g| !g.is_empty());
        if has_steps && self.config.condition.as_deref().map_or(true, |c| c.trim().is_empty()) {
            return Err(StepError::system(format!("条件步骤 {} 缺少 condition", step.spec.id)));
        }
        Ok(())
    }

    async fn execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        let spec = step.spec;
        let groups = spec.child_groups();

        if groups.iter().all(|g| g.is_empty()) {
            step.skip();
            return Ok(());
        }

        let condition = self.config.condition.clone().unwrap_or_default();
        let value = step.run_script(&condition, ErrorKind::Execute, Vec::new()).await?;
        let matched = truthy(&value);
        self.result = Some([matched, !matched]);
        let selected = if matched { 0 } else { 1 };
        debug!("条件 {} 求值为 {}，执行分支 {}", spec.id, matched, selected);

        let mut outcome = None;
        for (g, steps) in groups.iter().enumerate() {
            if g == selected {
                outcome = Some(
                    step.run_group(g, steps, step.scope.branch(), self.config.continue_on_error)
                        .await,
                );
            } else {
                step.skip_group(g, steps).await;
            }
        }

        let Some(outcome) = outcome else {
            step.skip();
            return Ok(());
        };
        if let Some(error) = outcome.error() {
            return Err(error);
        }
        // 分支为空或子步骤全部跳过
        if outcome.status == StepStatus::Skip {
            step.skip();
        }
        Ok(())
    }

    fn extra_result(&self) -> Value {
        match self.result {
            Some(result) => json!({ "result": result }),
            None => Value::Null,
        }
    }
}
