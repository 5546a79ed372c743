//! 结果树

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{ExecuteStatus, StepError, StepSpec, StepState, StepStatus};

/// 节点路径段：分组序号 + 组内序号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathSegment {
    pub group: usize,
    pub index: usize,
}

/// 节点在结果树中的位置
///
/// 字符串形式为 `2/0.1/1.0`：首段为顶层序号，后续每段为 `分组.序号`。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodePath {
    root: usize,
    segments: Vec<PathSegment>,
}

impl NodePath {
    /// 顶层步骤路径
    pub fn root(index: usize) -> Self {
        Self {
            root: index,
            segments: Vec::new(),
        }
    }

    /// 子节点路径
    pub fn child(&self, group: usize, index: usize) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment { group, index });
        Self {
            root: self.root,
            segments,
        }
    }

    pub fn root_index(&self) -> usize {
        self.root
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// 树深度 (顶层为 0)
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// 在兄弟节点中的序号
    pub fn index(&self) -> usize {
        self.segments.last().map(|s| s.index).unwrap_or(self.root)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for segment in &self.segments {
            write!(f, "/{}.{}", segment.group, segment.index)?;
        }
        Ok(())
    }
}

impl FromStr for NodePath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let root = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("无效的节点路径: {}", s))?;
        let mut segments = Vec::new();
        for part in parts {
            let (group, index) = part
                .split_once('.')
                .and_then(|(g, i)| Some((g.parse().ok()?, i.parse().ok()?)))
                .ok_or_else(|| format!("无效的节点路径: {}", s))?;
            segments.push(PathSegment { group, index });
        }
        Ok(Self { root, segments })
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// 脚本控制台输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,

    /// 毫秒时间戳
    pub time: i64,

    /// 输出的值 (已去环)
    pub values: Vec<Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, values: Vec<Value>) -> Self {
        Self {
            level,
            time: chrono::Utc::now().timestamp_millis(),
            values,
        }
    }
}

/// 结果节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultNode {
    pub id: String,

    #[serde(rename = "type")]
    pub step_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// 节点路径 (字符串形式)
    pub key: String,

    /// 树深度
    pub deep: usize,

    /// 兄弟节点中的序号
    pub index: usize,

    pub status: StepStatus,

    pub state: StepState,

    #[serde(rename = "error", default)]
    pub errors: Vec<StepError>,

    /// 总耗时 (毫秒)
    #[serde(default)]
    pub total_time: u64,

    /// 结果摘要
    #[serde(default)]
    pub extra: Value,

    /// 脚本日志
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,

    /// 子节点，形状与步骤定义一致
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<ChildResults>,
}

impl ResultNode {
    /// 按步骤定义创建等待状态的节点
    pub fn pending(spec: &StepSpec, path: &NodePath) -> Self {
        Self {
            id: spec.id.clone(),
            step_type: spec.step_type.clone(),
            name: spec.name.clone(),
            key: path.to_string(),
            deep: path.depth(),
            index: path.index(),
            status: StepStatus::Wait,
            state: StepState::Init,
            errors: Vec::new(),
            total_time: 0,
            extra: Value::Null,
            logs: Vec::new(),
            children: None,
        }
    }

    /// 节点自身错误中的最高严重级别
    pub fn max_severity(&self) -> u8 {
        crate::max_severity(&self.errors)
    }

    /// 按相对路径段查找后代节点
    pub fn descendant(&self, segments: &[PathSegment]) -> Option<&ResultNode> {
        let Some((first, rest)) = segments.split_first() else {
            return Some(self);
        };
        self.children
            .as_ref()?
            .get(first.group, first.index)?
            .descendant(rest)
    }

    /// 按相对路径段查找后代节点 (可变)
    pub fn descendant_mut(&mut self, segments: &[PathSegment]) -> Option<&mut ResultNode> {
        let Some((first, rest)) = segments.split_first() else {
            return Some(self);
        };
        self.children
            .as_mut()?
            .get_mut(first.group, first.index)?
            .descendant_mut(rest)
    }

    /// 深度优先遍历
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a ResultNode)) {
        visit(self);
        if let Some(children) = &self.children {
            for node in children.iter() {
                node.walk(visit);
            }
        }
    }
}

/// 子节点集合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChildResults {
    Groups(Vec<Vec<ResultNode>>),
    Flat(Vec<ResultNode>),
}

impl ChildResults {
    pub fn get(&self, group: usize, index: usize) -> Option<&ResultNode> {
        match self {
            Self::Flat(nodes) if group == 0 => nodes.get(index),
            Self::Flat(_) => None,
            Self::Groups(groups) => groups.get(group)?.get(index),
        }
    }

    pub fn get_mut(&mut self, group: usize, index: usize) -> Option<&mut ResultNode> {
        match self {
            Self::Flat(nodes) if group == 0 => nodes.get_mut(index),
            Self::Flat(_) => None,
            Self::Groups(groups) => groups.get_mut(group)?.get_mut(index),
        }
    }

    /// 追加分组 (循环迭代)
    pub fn push_group(&mut self, group: Vec<ResultNode>) {
        match self {
            Self::Groups(groups) => groups.push(group),
            Self::Flat(nodes) => {
                let existing = std::mem::take(nodes);
                *self = Self::Groups(vec![existing, group]);
            }
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &ResultNode> + '_> {
        match self {
            Self::Flat(nodes) => Box::new(nodes.iter()),
            Self::Groups(groups) => Box::new(groups.iter().flatten()),
        }
    }

    pub fn group_count(&self) -> usize {
        match self {
            Self::Flat(_) => 1,
            Self::Groups(groups) => groups.len(),
        }
    }
}

/// 单次执行的完整结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execute_id: String,

    pub status: ExecuteStatus,

    /// 总耗时 (毫秒)
    pub total_time: u64,

    /// 重试次数
    #[serde(default)]
    pub retry: u32,

    /// 顶层步骤结果
    pub steps: Vec<ResultNode>,

    /// 步骤详情 (节点路径 -> 详情)
    #[serde(default)]
    pub details: BTreeMap<String, Value>,

    /// 执行级错误
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl ExecutionResult {
    pub fn new(execute_id: &str) -> Self {
        Self {
            execute_id: execute_id.to_string(),
            status: ExecuteStatus::Wait,
            total_time: 0,
            retry: 0,
            steps: Vec::new(),
            details: BTreeMap::new(),
            error: None,
        }
    }

    /// 按路径查找节点
    pub fn node(&self, path: &NodePath) -> Option<&ResultNode> {
        self.steps
            .get(path.root_index())?
            .descendant(path.segments())
    }

    /// 按步骤 ID 查找第一个匹配的节点
    pub fn find_by_id(&self, id: &str) -> Option<&ResultNode> {
        let mut found = None;
        for root in &self.steps {
            root.walk(&mut |node| {
                if found.is_none() && node.id == id {
                    found = Some(node);
                }
            });
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_path_display_and_parse() {
        let path = NodePath::root(2).child(0, 1).child(1, 0);
        assert_eq!(path.to_string(), "2/0.1/1.0");
        assert_eq!(path.depth(), 2);
        assert_eq!(path.index(), 0);

        let parsed: NodePath = "2/0.1/1.0".parse().unwrap();
        assert_eq!(parsed, path);
        assert!("x/1".parse::<NodePath>().is_err());
        assert!("1/2".parse::<NodePath>().is_err());
    }

    #[test]
    fn test_descendant_lookup() {
        let parent_spec = StepSpec::new("c", "condition");
        let child_spec = StepSpec::new("a", "empty");
        let root = NodePath::root(0);
        let mut node = ResultNode::pending(&parent_spec, &root);
        node.children = Some(ChildResults::Groups(vec![
            vec![ResultNode::pending(&child_spec, &root.child(0, 0))],
            vec![],
        ]));

        let mut result = ExecutionResult::new("e1");
        result.steps.push(node);

        let found = result.node(&"0/0.0".parse().unwrap()).unwrap();
        assert_eq!(found.id, "a");
        assert_eq!(found.deep, 1);
        assert!(result.node(&"0/1.0".parse().unwrap()).is_none());
        assert_eq!(result.find_by_id("a").unwrap().key, "0/0.0");
    }

    #[test]
    fn test_push_group_converts_flat() {
        let spec = StepSpec::new("a", "empty");
        let mut children = ChildResults::Flat(vec![ResultNode::pending(&spec, &NodePath::root(0))]);
        children.push_group(vec![]);
        assert_eq!(children.group_count(), 2);
        assert!(children.get(0, 0).is_some());
    }
}
