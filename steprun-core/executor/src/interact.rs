//! 交互等待
//!
//! 进入 INTERACT 状态的步骤在这里登记一个一次性通道，INTERACT 任务按
//! 节点路径或步骤 ID 找到它并投递用户输入。

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{ExecutorError, Result};

struct Waiting {
    step_id: String,
    sender: oneshot::Sender<Value>,
}

/// 等待交互的步骤
#[derive(Default)]
pub struct InteractHub {
    waiting: Mutex<HashMap<String, Waiting>>,
}

impl InteractHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiting>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记等待，返回接收用户输入的通道
    pub fn wait(&self, key: &str, step_id: &str) -> oneshot::Receiver<Value> {
        let (sender, receiver) = oneshot::channel();
        self.lock().insert(
            key.to_string(),
            Waiting {
                step_id: step_id.to_string(),
                sender,
            },
        );
        receiver
    }

    /// 投递用户输入
    ///
    /// 节点不在等待状态 (尚未进入、已经完成或已超时) 时返回 `NotInteracting`。
    pub fn answer(&self, node: &str, answer: Value) -> Result<()> {
        let waiting = {
            let mut waiting = self.lock();
            let key = if waiting.contains_key(node) {
                Some(node.to_string())
            } else {
                waiting
                    .iter()
                    .find(|(_, w)| w.step_id == node)
                    .map(|(key, _)| key.clone())
            };
            key.and_then(|key| waiting.remove(&key))
        };

        let waiting = waiting.ok_or_else(|| ExecutorError::NotInteracting(node.to_string()))?;
        debug!("步骤 {} 收到交互输入", waiting.step_id);
        waiting
            .sender
            .send(answer)
            .map_err(|_| ExecutorError::NotInteracting(node.to_string()))
    }

    /// 撤销等待
    pub fn withdraw(&self, key: &str) {
        self.lock().remove(key);
    }

    /// 正在等待交互的节点路径
    pub fn pending(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}
