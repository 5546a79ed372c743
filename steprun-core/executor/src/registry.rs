//! 控制器注册表
//!
//! 步骤类型标签 -> 控制器工厂。未注册的类型解析为 `unknown` 控制器，
//! 执行时报告系统错误，不影响整棵树的构建。

use std::collections::HashMap;
use std::sync::Arc;
use steprun_common::{ChildResults, ChildSteps, NodePath, ResultNode, StepSpec};
use tracing::{debug, info};

use crate::steps::{self, UnknownFactory};
use crate::{ControllerFactory, ExecutorError, Result};

/// 控制器注册表
///
/// 在工作线程启动时构建，之后只读。
pub struct ControllerRegistry {
    factories: HashMap<String, Arc<dyn ControllerFactory>>,
    unknown: Arc<dyn ControllerFactory>,
}

impl ControllerRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            unknown: Arc::new(UnknownFactory),
        }
    }

    /// 注册了全部内置步骤类型的注册表
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        steps::register_builtin(&mut registry);
        registry
    }

    /// 注册步骤类型
    pub fn register(&mut self, factory: Arc<dyn ControllerFactory>) -> Result<()> {
        let step_type = factory.step_type().to_string();
        if self.factories.contains_key(&step_type) {
            return Err(ExecutorError::AlreadyRegistered(step_type));
        }
        info!("注册步骤类型: {}", step_type);
        self.factories.insert(step_type, factory);
        Ok(())
    }

    /// 注销步骤类型
    pub fn unregister(&mut self, step_type: &str) -> Option<Arc<dyn ControllerFactory>> {
        let removed = self.factories.remove(step_type);
        if removed.is_some() {
            info!("注销步骤类型: {}", step_type);
        }
        removed
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn ControllerFactory>> {
        self.factories.get(step_type).cloned()
    }

    /// 查找工厂，未注册时返回 unknown 工厂
    pub fn factory(&self, step_type: &str) -> Arc<dyn ControllerFactory> {
        self.get(step_type).unwrap_or_else(|| {
            debug!("未注册的步骤类型: {}", step_type);
            Arc::clone(&self.unknown)
        })
    }

    /// 已注册的步骤类型
    pub fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// 按步骤定义生成初始结果节点
    pub fn init_result(&self, spec: &StepSpec, path: &NodePath) -> ResultNode {
        let base = ResultNode::pending(spec, path);
        let mut node = self.factory(&spec.step_type).create_init_result(base, spec);
        if node.children.is_none() {
            node.children = spec.steps.as_ref().map(|children| match children {
                ChildSteps::Flat(steps) => ChildResults::Flat(self.init_group(steps, path, 0)),
                ChildSteps::Groups(groups) => ChildResults::Groups(
                    groups
                        .iter()
                        .enumerate()
                        .map(|(g, steps)| self.init_group(steps, path, g))
                        .collect(),
                ),
            });
        }
        node
    }

    /// 一个分组的初始结果节点
    pub fn init_group(&self, steps: &[StepSpec], parent: &NodePath, group: usize) -> Vec<ResultNode> {
        steps
            .iter()
            .enumerate()
            .map(|(i, step)| self.init_result(step, &parent.child(group, i)))
            .collect()
    }
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::FnFactory;
    use crate::steps::EmptyStep;

    #[test]
    fn test_register_and_unregister() {
        let mut registry = ControllerRegistry::new();
        registry
            .register(Arc::new(FnFactory::new("custom", EmptyStep::build)))
            .unwrap();
        assert!(matches!(
            registry.register(Arc::new(FnFactory::new("custom", EmptyStep::build))),
            Err(ExecutorError::AlreadyRegistered(_))
        ));
        assert_eq!(registry.list(), vec!["custom".to_string()]);

        assert!(registry.unregister("custom").is_some());
        assert!(registry.get("custom").is_none());
        assert_eq!(registry.factory("custom").step_type(), "unknown");
    }

    #[test]
    fn test_builtin_types() {
        let registry = ControllerRegistry::with_builtin();
        for step_type in ["script", "wait", "empty", "group", "condition", "loop", "poll", "dataset", "component"] {
            assert!(registry.get(step_type).is_some(), "{} 未注册", step_type);
        }
    }

    #[test]
    fn test_init_result_shapes() {
        let registry = ControllerRegistry::with_builtin();
        let condition = StepSpec::new("c", "condition").with_groups(vec![
            vec![StepSpec::new("a", "empty"), StepSpec::new("b", "empty")],
            vec![StepSpec::new("x", "empty")],
        ]);
        let node = registry.init_result(&condition, &NodePath::root(1));
        let children = node.children.unwrap();
        assert_eq!(children.group_count(), 2);
        assert_eq!(children.get(0, 1).unwrap().key, "1/0.1");
        assert_eq!(children.get(1, 0).unwrap().deep, 1);

        let looped = StepSpec::new("l", "loop").with_steps(vec![StepSpec::new("a", "empty")]);
        let node = registry.init_result(&looped, &NodePath::root(0));
        assert!(matches!(node.children, Some(ChildResults::Groups(ref g)) if g.is_empty()));
    }
}
