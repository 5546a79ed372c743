//! 组件：带参数和返回值的可复用子步骤集合

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use steprun_common::{StepError, StepSpec, VariableTier};
use tracing::debug;

use crate::{Controller, StepRuntime};

#[derive(Debug, Clone, Deserialize)]
struct Param {
    name: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct Return {
    /// 子步骤作用域中的变量名
    name: String,
    /// 写回的变量名，默认与 name 相同
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    scope: VariableTier,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComponentConfig {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    params: Vec<Param>,
    #[serde(default)]
    returns: Vec<Return>,
    #[serde(default)]
    continue_on_error: bool,
}

#[derive(Default)]
pub struct ComponentStep {
    config: ComponentConfig,
    returned: Map<String, Value>,
}

impl ComponentStep {
    pub fn build(_spec: &StepSpec, _prepared: Value) -> Box<dyn Controller> {
        Box::<Self>::default()
    }
}

#[async_trait]
impl Controller for ComponentStep {
    async fn before_execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        self.config = step.config()?;
        Ok(())
    }

    async fn execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        let spec = step.spec;
        let steps = spec.child_groups().first().copied().unwrap_or(&[]);
        debug!(
            "执行组件 {}",
            self.config.name.as_deref().unwrap_or(spec.display_name())
        );

        let mut scope = step.scope.branch();
        for param in &self.config.params {
            scope.set(&param.name, step.scope.render_value(&param.value));
        }

        let outcome = step
            .run_group(0, steps, scope, self.config.continue_on_error)
            .await;
        if let Some(error) = outcome.error() {
            return Err(error);
        }

        for ret in &self.config.returns {
            let value = outcome.scope.get(&ret.name).ok_or_else(|| {
                StepError::assignment(format!("组件返回值 {} 不存在", ret.name))
            })?;
            let target = ret.target.as_deref().unwrap_or(&ret.name);
            step.scope.set_in(ret.scope, target, value.clone());
            self.returned.insert(target.to_string(), value);
        }

        if steps.is_empty() {
            step.skip();
        }
        Ok(())
    }

    fn extra_result(&self) -> Value {
        Value::Object(self.returned.clone())
    }
}
