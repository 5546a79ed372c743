//! 结果树
//!
//! 执行过程中所有节点的状态都写在这里，QUERY 随时可以读取快照。

use std::sync::Arc;
use steprun_common::{ChildResults, NodePath, ResultNode, StepError, StepState, StepStatus};
use tokio::sync::RwLock;

/// 节点进度快照
#[derive(Debug, Clone, PartialEq)]
pub struct NodeProgress {
    pub key: String,
    pub id: String,
    pub status: StepStatus,
    pub state: StepState,
    pub total_time: u64,
}

impl NodeProgress {
    fn of(node: &ResultNode) -> Self {
        Self {
            key: node.key.clone(),
            id: node.id.clone(),
            status: node.status,
            state: node.state,
            total_time: node.total_time,
        }
    }
}

/// 共享的结果树
#[derive(Debug, Clone, Default)]
pub struct ResultTree {
    roots: Arc<RwLock<Vec<ResultNode>>>,
}

impl ResultTree {
    pub fn new(roots: Vec<ResultNode>) -> Self {
        Self {
            roots: Arc::new(RwLock::new(roots)),
        }
    }

    /// 修改节点，返回修改后的进度快照
    pub async fn update<F>(&self, path: &NodePath, f: F) -> Option<NodeProgress>
    where
        F: FnOnce(&mut ResultNode),
    {
        let mut roots = self.roots.write().await;
        let node = locate_mut(&mut roots, path)?;
        f(node);
        Some(NodeProgress::of(node))
    }

    /// 替换父节点下的一个子分组，缺失的分组以空分组补齐
    pub async fn set_group(&self, parent: &NodePath, group: usize, nodes: Vec<ResultNode>) -> bool {
        let mut roots = self.roots.write().await;
        let Some(node) = locate_mut(&mut roots, parent) else {
            return false;
        };

        let mut groups = match node.children.take() {
            Some(ChildResults::Flat(_)) if group == 0 => {
                node.children = Some(ChildResults::Flat(nodes));
                return true;
            }
            Some(ChildResults::Flat(flat)) => vec![flat],
            Some(ChildResults::Groups(groups)) => groups,
            None => Vec::new(),
        };
        if groups.len() <= group {
            groups.resize_with(group + 1, Vec::new);
        }
        groups[group] = nodes;
        node.children = Some(ChildResults::Groups(groups));
        true
    }

    /// 整棵树快照
    pub async fn snapshot(&self) -> Vec<ResultNode> {
        self.roots.read().await.clone()
    }

    /// 单个节点快照
    pub async fn node(&self, path: &NodePath) -> Option<ResultNode> {
        let roots = self.roots.read().await;
        roots.get(path.root_index())?.descendant(path.segments()).cloned()
    }

    /// 按节点路径或步骤 ID 查找节点
    pub async fn find(&self, key_or_id: &str) -> Option<NodePath> {
        let roots = self.roots.read().await;
        if let Ok(path) = key_or_id.parse::<NodePath>() {
            if roots
                .get(path.root_index())
                .and_then(|root| root.descendant(path.segments()))
                .is_some()
            {
                return Some(path);
            }
        }

        let mut found = None;
        for root in roots.iter() {
            root.walk(&mut |node| {
                if found.is_none() && node.id == key_or_id {
                    found = Some(node.key.clone());
                }
            });
        }
        found.and_then(|key| key.parse().ok())
    }

    /// 将节点及其全部后代标记为跳过
    pub async fn skip_subtree(&self, path: &NodePath) -> Option<NodeProgress> {
        self.update(path, |node| mark_skipped(node)).await
    }

    /// 执行中止后收尾：未开始的节点记为跳过，执行中的节点记为失败
    pub async fn settle(&self, path: &NodePath, error: &StepError) {
        let mut roots = self.roots.write().await;
        if let Some(node) = locate_mut(&mut roots, path) {
            settle_node(node, error);
        }
    }
}

fn locate_mut<'a>(roots: &'a mut [ResultNode], path: &NodePath) -> Option<&'a mut ResultNode> {
    roots
        .get_mut(path.root_index())?
        .descendant_mut(path.segments())
}

fn for_each_child(node: &mut ResultNode, f: &mut dyn FnMut(&mut ResultNode)) {
    match node.children.as_mut() {
        Some(ChildResults::Flat(nodes)) => nodes.iter_mut().for_each(|n| f(n)),
        Some(ChildResults::Groups(groups)) => groups.iter_mut().flatten().for_each(|n| f(n)),
        None => {}
    }
}

fn mark_skipped(node: &mut ResultNode) {
    if !node.status.is_terminal() {
        node.status = StepStatus::Skip;
        node.state = StepState::Done;
    }
    for_each_child(node, &mut mark_skipped);
}

fn settle_node(node: &mut ResultNode, error: &StepError) {
    match node.status {
        StepStatus::Wait => {
            node.status = StepStatus::Skip;
            node.state = StepState::Done;
        }
        StepStatus::Running | StepStatus::Interact => {
            node.status = StepStatus::Error;
            node.state = StepState::Done;
            node.errors.push(error.clone());
        }
        _ => {}
    }
    for_each_child(node, &mut |child| settle_node(child, error));
}

#[cfg(test)]
mod tests {
    use super::*;
    use steprun_common::StepSpec;

    fn tree() -> ResultTree {
        let spec = StepSpec::new("loop", "loop");
        let mut root = ResultNode::pending(&spec, &NodePath::root(0));
        root.children = Some(ChildResults::Groups(Vec::new()));
        ResultTree::new(vec![root])
    }

    fn child(id: &str, path: &NodePath) -> ResultNode {
        ResultNode::pending(&StepSpec::new(id, "empty"), path)
    }

    #[tokio::test]
    async fn test_set_group_pads_missing_groups() {
        let tree = tree();
        let root = NodePath::root(0);
        assert!(tree.set_group(&root, 2, vec![child("a", &root.child(2, 0))]).await);

        let node = tree.node(&root).await.unwrap();
        let children = node.children.unwrap();
        assert_eq!(children.group_count(), 3);
        assert_eq!(children.get(2, 0).unwrap().id, "a");
        assert!(children.get(0, 0).is_none());
    }

    #[tokio::test]
    async fn test_set_group_zero_keeps_flat_shape() {
        let spec = StepSpec::new("group", "group");
        let mut node = ResultNode::pending(&spec, &NodePath::root(0));
        node.children = Some(ChildResults::Flat(Vec::new()));
        let tree = ResultTree::new(vec![node]);
        let root = NodePath::root(0);
        tree.set_group(&root, 0, vec![child("a", &root.child(0, 0))]).await;
        let node = tree.node(&root).await.unwrap();
        assert!(matches!(node.children, Some(ChildResults::Flat(ref n)) if n.len() == 1));
    }

    #[tokio::test]
    async fn test_find_by_key_or_id() {
        let tree = tree();
        let root = NodePath::root(0);
        tree.set_group(&root, 1, vec![child("inner", &root.child(1, 0))]).await;

        assert_eq!(tree.find("0/1.0").await, Some(root.child(1, 0)));
        assert_eq!(tree.find("inner").await, Some(root.child(1, 0)));
        assert_eq!(tree.find("missing").await, None);
    }

    #[tokio::test]
    async fn test_settle_after_cancel() {
        let tree = tree();
        let root = NodePath::root(0);
        tree.set_group(
            &root,
            0,
            vec![child("a", &root.child(0, 0)), child("b", &root.child(0, 1))],
        )
        .await;
        tree.update(&root, |n| n.status = StepStatus::Running).await;
        tree.update(&root.child(0, 0), |n| n.status = StepStatus::Interact).await;

        tree.settle(&root, &StepError::general("已取消")).await;

        let node = tree.node(&root).await.unwrap();
        assert_eq!(node.status, StepStatus::Error);
        let children = node.children.unwrap();
        assert_eq!(children.get(0, 0).unwrap().status, StepStatus::Error);
        assert_eq!(children.get(0, 1).unwrap().status, StepStatus::Skip);
    }
}
