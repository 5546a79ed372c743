//! 内置步骤类型
//!
//! 叶子步骤: script / wait / empty；组合步骤: group / condition / loop /
//! poll / dataset / component。协议类步骤由插件另行注册。

mod component;
mod condition;
mod dataset;
mod group;
mod iterate;
mod loop_step;
mod poll;
mod single;

pub use component::ComponentStep;
pub use condition::ConditionStep;
pub use dataset::{DataSetFactory, DataSetStep, FieldMode, MockGenerator};
pub use group::GroupStep;
pub use iterate::{IterationOutcome, IterationPlan};
pub use loop_step::LoopStep;
pub use poll::PollStep;
pub use single::{EmptyStep, ScriptStep, UnknownFactory, WaitStep};

use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::controller::FnFactory;
use crate::{ControllerFactory, ControllerRegistry};

/// 注册全部内置步骤类型
pub fn register_builtin(registry: &mut ControllerRegistry) {
    let factories: Vec<Arc<dyn ControllerFactory>> = vec![
        Arc::new(FnFactory::new("script", ScriptStep::build)),
        Arc::new(FnFactory::new("wait", WaitStep::build)),
        Arc::new(FnFactory::new("empty", EmptyStep::build)),
        Arc::new(FnFactory::new("group", GroupStep::build)),
        Arc::new(FnFactory::new("condition", ConditionStep::build)),
        Arc::new(FnFactory::new("component", ComponentStep::build)),
        Arc::new(FnFactory::new("loop", LoopStep::build).iterative()),
        Arc::new(FnFactory::new("poll", PollStep::build).iterative()),
        Arc::new(DataSetFactory),
    ];
    for factory in factories {
        if let Err(e) = registry.register(factory) {
            warn!("内置步骤注册失败: {}", e);
        }
    }
}

/// 脚本返回值的真假判断
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// 数字或可解析为数字的字符串
pub(crate) fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthy() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(2)));
        assert!(truthy(&json!("yes")));
        assert!(truthy(&json!([])));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!("false")));
        assert!(!truthy(&Value::Null));
    }

    #[test]
    fn test_as_count() {
        assert_eq!(as_count(&json!(3)), Some(3));
        assert_eq!(as_count(&json!(" 12 ")), Some(12));
        assert_eq!(as_count(&json!(-1)), None);
        assert_eq!(as_count(&json!("x")), None);
    }
}
