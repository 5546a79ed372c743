//! 步骤与执行批次定义

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use crate::StepFlags;

/// 步骤定义 (不可变输入)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// 步骤 ID
    pub id: String,

    /// 步骤类型 (决定叶子/组合语义)
    #[serde(rename = "type")]
    pub step_type: String,

    /// 显示名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// 步骤标志
    #[serde(default)]
    pub flag: StepFlags,

    /// 前置脚本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_script: Option<String>,

    /// 后置脚本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_script: Option<String>,

    /// 变量提取规则
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignment: Vec<Assignment>,

    /// 断言规则
    #[serde(default, rename = "assert", skip_serializing_if = "Vec::is_empty")]
    pub asserts: Vec<AssertRule>,

    /// 子步骤 (组合步骤)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<ChildSteps>,

    /// 类型相关配置
    #[serde(default)]
    pub config: Value,

    /// 执行超时 (毫秒)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// 执行失败后仍然进行变量提取和断言
    #[serde(default)]
    pub ignore_error: bool,

    /// 脚本超时 (毫秒)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_timeout: Option<u64>,

    /// 交互定义
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interact: Option<InteractSpec>,
}

impl StepSpec {
    /// 创建最简步骤
    pub fn new(id: &str, step_type: &str) -> Self {
        Self {
            id: id.to_string(),
            step_type: step_type.to_string(),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_steps(mut self, steps: Vec<StepSpec>) -> Self {
        self.steps = Some(ChildSteps::Flat(steps));
        self
    }

    pub fn with_groups(mut self, groups: Vec<Vec<StepSpec>>) -> Self {
        self.steps = Some(ChildSteps::Groups(groups));
        self
    }

    pub fn with_pre_script(mut self, script: &str) -> Self {
        self.pre_script = Some(script.to_string());
        self
    }

    pub fn with_post_script(mut self, script: &str) -> Self {
        self.post_script = Some(script.to_string());
        self
    }

    /// 显示名称，未配置时使用 ID
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// 子步骤分组 (扁平列表视为单个分组)
    pub fn child_groups(&self) -> Vec<&[StepSpec]> {
        match &self.steps {
            None => Vec::new(),
            Some(children) => children.groups(),
        }
    }
}

/// 子步骤：扁平列表 (顺序执行) 或分组列表 (分支、迭代)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChildSteps {
    Groups(Vec<Vec<StepSpec>>),
    Flat(Vec<StepSpec>),
}

impl ChildSteps {
    pub fn groups(&self) -> Vec<&[StepSpec]> {
        match self {
            Self::Flat(steps) => vec![steps.as_slice()],
            Self::Groups(groups) => groups.iter().map(|g| g.as_slice()).collect(),
        }
    }

    /// 所有分组都为空
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Flat(steps) => steps.is_empty(),
            Self::Groups(groups) => groups.iter().all(|g| g.is_empty()),
        }
    }
}

/// 变量作用域层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VariableTier {
    /// 上下文局部 (最内层，随子调用复制)
    #[default]
    Context,
    /// 用例局部
    Local,
    /// 全局
    Global,
}

/// 提取来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    /// 步骤结果摘要
    #[default]
    Extra,
    /// 已有变量
    Variable,
    /// 字面量
    Literal,
}

/// 变量提取规则
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// 目标变量名
    pub name: String,

    /// 来源
    #[serde(default)]
    pub source: ValueSource,

    /// 路径 (JSON Pointer 或点分路径；Variable 来源时为变量名)
    #[serde(default)]
    pub path: Option<String>,

    /// 字面量值
    #[serde(default)]
    pub value: Option<Value>,

    /// 写入的作用域
    #[serde(default)]
    pub scope: VariableTier,
}

/// 比较方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    NotContains,
    Exists,
    NotExists,
    Regex,
    Empty,
    NotEmpty,
}

/// 断言规则
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertRule {
    /// 断言名称
    #[serde(default)]
    pub name: Option<String>,

    /// 来源
    #[serde(default)]
    pub source: ValueSource,

    /// 路径
    #[serde(default)]
    pub path: Option<String>,

    /// 比较方式
    pub comparator: Comparator,

    /// 期望值 (字符串中的 `{{var}}` 会先渲染)
    #[serde(default)]
    pub expected: Value,
}

/// 交互定义
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractSpec {
    /// 提示信息
    pub message: String,

    /// 保存用户输入的变量名 (默认 `_interact`)
    #[serde(default)]
    pub variable: Option<String>,

    /// 表单描述，原样转发给调用方
    #[serde(default)]
    pub fields: Value,

    /// 等待超时 (毫秒)，未设置时一直等待直到取消
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// 数据源声明
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSpec {
    /// 数据源类型标签
    #[serde(rename = "type")]
    pub source_type: String,

    /// 连接配置
    #[serde(default)]
    pub config: Value,
}

/// 执行环境 (只读)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteEnv {
    /// 后端服务
    #[serde(default)]
    pub servers: HashMap<String, Value>,

    /// 数据源
    #[serde(default)]
    pub data_sources: HashMap<String, DataSourceSpec>,

    /// 共享脚本片段 (可在脚本中按名称 import)
    #[serde(default)]
    pub scripts: HashMap<String, String>,

    /// 浏览器目标
    #[serde(default)]
    pub browsers: HashMap<String, Value>,

    /// 全局变量初值
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// 上报模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteMode {
    /// 只上报最终结果
    Sync,
    /// 实时上报进度和日志
    #[default]
    Async,
}

/// 单次执行定义
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteSpec {
    /// 执行 ID
    pub id: String,

    /// 用例名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// 顶层步骤
    #[serde(default)]
    pub steps: Vec<StepSpec>,

    /// 用例变量初值
    #[serde(default)]
    pub variables: Map<String, Value>,

    /// 整体超时 (毫秒)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// 上报模式
    #[serde(default)]
    pub mode: ExecuteMode,

    /// 异常退出后的重试次数 (覆盖批次配置)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
}

/// 执行批次
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    /// 共享环境
    #[serde(default)]
    pub env: ExecuteEnv,

    /// 执行列表
    pub executions: Vec<ExecuteSpec>,
}

impl Batch {
    /// 执行前校验，返回所有问题
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        let mut ids = HashSet::new();

        if self.executions.is_empty() {
            problems.push("执行列表为空".to_string());
        }

        for execution in &self.executions {
            if execution.id.trim().is_empty() {
                problems.push("存在缺少 id 的执行".to_string());
            } else if !ids.insert(execution.id.as_str()) {
                problems.push(format!("执行 id 重复: {}", execution.id));
            }
            validate_steps(&execution.id, &execution.steps, &mut problems);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

fn validate_steps(execute_id: &str, steps: &[StepSpec], problems: &mut Vec<String>) {
    for step in steps {
        if step.id.trim().is_empty() {
            problems.push(format!("执行 {} 中存在缺少 id 的步骤", execute_id));
        }
        if step.step_type.trim().is_empty() {
            problems.push(format!("执行 {} 的步骤 {} 缺少 type", execute_id, step.id));
        }
        for group in step.child_groups() {
            validate_steps(execute_id, group, problems);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_child_steps_shapes() {
        let flat: StepSpec = serde_json::from_value(json!({
            "id": "g",
            "type": "group",
            "steps": [{"id": "a", "type": "empty"}, {"id": "b", "type": "empty"}]
        }))
        .unwrap();
        assert!(matches!(flat.steps, Some(ChildSteps::Flat(ref s)) if s.len() == 2));
        assert_eq!(flat.child_groups().len(), 1);

        let grouped: StepSpec = serde_json::from_value(json!({
            "id": "c",
            "type": "condition",
            "steps": [[{"id": "a", "type": "empty"}], []]
        }))
        .unwrap();
        assert!(matches!(grouped.steps, Some(ChildSteps::Groups(ref g)) if g.len() == 2));
        assert_eq!(grouped.child_groups()[1].len(), 0);
    }

    #[test]
    fn test_step_spec_defaults() {
        let step: StepSpec = serde_json::from_value(json!({
            "id": "s1",
            "type": "script",
            "preScript": "ctx.set(\"a\", 1);",
            "assert": [{"path": "/code", "comparator": "eq", "expected": 0}],
            "flag": 1
        }))
        .unwrap();
        assert_eq!(step.pre_script.as_deref(), Some("ctx.set(\"a\", 1);"));
        assert_eq!(step.asserts.len(), 1);
        assert_eq!(step.asserts[0].comparator, Comparator::Eq);
        assert!(step.flag.is_disabled());
        assert!(!step.ignore_error);
    }

    #[test]
    fn test_batch_validation() {
        let batch = Batch {
            env: ExecuteEnv::default(),
            executions: vec![
                ExecuteSpec {
                    id: "e1".to_string(),
                    steps: vec![StepSpec::new("s1", "")],
                    ..Default::default()
                },
                ExecuteSpec {
                    id: "e1".to_string(),
                    ..Default::default()
                },
            ],
        };
        let problems = batch.validate().unwrap_err();
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("重复")));
        assert!(problems.iter().any(|p| p.contains("缺少 type")));
    }

    #[test]
    fn test_empty_batch_is_invalid() {
        assert!(Batch::default().validate().is_err());
    }
}
