//! 叶子步骤

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use steprun_common::{ErrorKind, StepError, StepSpec};

use super::as_count;
use crate::{Controller, ControllerFactory, StepRuntime};

#[derive(Debug, Default, Deserialize)]
struct ScriptConfig {
    #[serde(default)]
    script: Option<String>,
}

/// 以一段脚本作为执行动作
#[derive(Default)]
pub struct ScriptStep {
    script: String,
    result: Value,
}

impl ScriptStep {
    pub fn build(_spec: &StepSpec, _prepared: Value) -> Box<dyn Controller> {
        Box::<Self>::default()
    }
}

#[async_trait]
impl Controller for ScriptStep {
    async fn before_execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        let config: ScriptConfig = step.config()?;
        self.script = config
            .script
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| StepError::system(format!("脚本步骤 {} 缺少 script", step.spec.id)))?;
        Ok(())
    }

    async fn execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        let script = std::mem::take(&mut self.script);
        self.result = step.run_script(&script, ErrorKind::Execute, Vec::new()).await?;
        Ok(())
    }

    fn extra_result(&self) -> Value {
        json!({ "result": self.result })
    }
}

#[derive(Debug, Default, Deserialize)]
struct WaitConfig {
    #[serde(default)]
    delay: Value,
}

/// 等待一段时间，`delay` 支持 `{{var}}` 模板
#[derive(Default)]
pub struct WaitStep {
    delay: u64,
}

impl WaitStep {
    pub fn build(_spec: &StepSpec, _prepared: Value) -> Box<dyn Controller> {
        Box::<Self>::default()
    }
}

#[async_trait]
impl Controller for WaitStep {
    async fn before_execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        let config: WaitConfig = step.config()?;
        let delay = step.scope.render_value(&config.delay);
        self.delay = as_count(&delay)
            .ok_or_else(|| StepError::system(format!("无效的等待时间: {}", delay)))?;
        Ok(())
    }

    async fn execute(&mut self, step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.delay)) => Ok(()),
            _ = step.exec.cancel.cancelled() => Err(StepError::general("等待被取消")),
        }
    }

    fn extra_result(&self) -> Value {
        json!({ "delay": self.delay })
    }
}

/// 空步骤
pub struct EmptyStep;

impl EmptyStep {
    pub fn build(_spec: &StepSpec, _prepared: Value) -> Box<dyn Controller> {
        Box::new(Self)
    }
}

#[async_trait]
impl Controller for EmptyStep {
    async fn execute(&mut self, _step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        Ok(())
    }
}

/// 未注册的步骤类型
pub struct UnknownFactory;

#[async_trait]
impl ControllerFactory for UnknownFactory {
    fn step_type(&self) -> &str {
        "unknown"
    }

    fn create(&self, spec: &StepSpec, _prepared: Value) -> Box<dyn Controller> {
        Box::new(UnknownStep {
            step_type: spec.step_type.clone(),
        })
    }
}

struct UnknownStep {
    step_type: String,
}

#[async_trait]
impl Controller for UnknownStep {
    async fn before_execute(&mut self, _step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        Err(StepError::system(format!("未知的步骤类型: {}", self.step_type)))
    }

    async fn execute(&mut self, _step: &mut StepRuntime<'_>) -> Result<(), StepError> {
        Ok(())
    }
}
