//! 执行上下文
//!
//! 一次执行内所有步骤共享的状态：结果树、取消令牌、事件通道、交互等待，
//! 以及已完成的控制器 (按需生成详情)。

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use steprun_common::{
    ExecuteEnv, ExecuteMode, ExecuteStatus, LogEntry, NodePath, ResultNode, WorkerEvent,
};
use steprun_pool::DataSourceRegistry;
use steprun_sandbox::ScriptSandbox;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::tree::NodeProgress;
use crate::{Controller, ControllerRegistry, InteractHub, ResultTree};

/// 工作线程持有的引擎服务
///
/// 每个工作线程各自一份，不跨线程共享。
#[derive(Clone)]
pub struct EngineServices {
    pub sandbox: Arc<ScriptSandbox>,
    pub registry: Arc<ControllerRegistry>,
    pub data_sources: Arc<DataSourceRegistry>,
}

impl EngineServices {
    pub fn new(
        sandbox: Arc<ScriptSandbox>,
        registry: Arc<ControllerRegistry>,
        data_sources: Arc<DataSourceRegistry>,
    ) -> Self {
        Self {
            sandbox,
            registry,
            data_sources,
        }
    }

    /// 默认沙箱 + 内置步骤类型 + 空数据源注册表
    pub fn builtin() -> Self {
        Self::new(
            Arc::new(ScriptSandbox::default()),
            Arc::new(ControllerRegistry::with_builtin()),
            Arc::new(DataSourceRegistry::new()),
        )
    }
}

/// 事件出口
///
/// 同步模式下只上报状态和最终结果，进度和日志被丢弃。
#[derive(Clone)]
pub struct EventSink {
    execute_id: String,
    mode: ExecuteMode,
    tx: Option<UnboundedSender<WorkerEvent>>,
}

impl EventSink {
    pub fn new(execute_id: &str, mode: ExecuteMode, tx: UnboundedSender<WorkerEvent>) -> Self {
        Self {
            execute_id: execute_id.to_string(),
            mode,
            tx: Some(tx),
        }
    }

    /// 不上报任何事件
    pub fn disabled(execute_id: &str) -> Self {
        Self {
            execute_id: execute_id.to_string(),
            mode: ExecuteMode::Sync,
            tx: None,
        }
    }

    pub fn execute_id(&self) -> &str {
        &self.execute_id
    }

    pub fn emit(&self, event: WorkerEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                trace!("事件通道已关闭: {}", self.execute_id);
            }
        }
    }

    pub fn status(&self, status: ExecuteStatus, retry: u32, message: Option<String>) {
        self.emit(WorkerEvent::Status {
            execute_id: self.execute_id.clone(),
            status,
            retry,
            message,
        });
    }

    pub fn progress(&self, progress: NodeProgress, prompt: Option<Value>) {
        if self.mode == ExecuteMode::Sync {
            return;
        }
        self.emit(WorkerEvent::Progress {
            execute_id: self.execute_id.clone(),
            key: progress.key,
            id: progress.id,
            status: progress.status,
            state: progress.state,
            total_time: progress.total_time,
            prompt,
        });
    }

    pub fn log(&self, key: &str, entry: LogEntry) {
        if self.mode == ExecuteMode::Sync {
            return;
        }
        self.emit(WorkerEvent::Log {
            execute_id: self.execute_id.clone(),
            key: key.to_string(),
            entry,
        });
    }
}

/// 单次执行的共享上下文
pub struct ExecutionContext {
    pub execute_id: String,
    pub env: Arc<ExecuteEnv>,
    pub services: EngineServices,
    pub cancel: CancellationToken,
    pub events: EventSink,
    pub interactions: InteractHub,
    pub tree: ResultTree,
    modules: Arc<HashMap<String, String>>,
    finished: Mutex<HashMap<String, Box<dyn Controller>>>,
    /// 控制器释放后留下的详情
    archived: Mutex<HashMap<String, Value>>,
}

impl ExecutionContext {
    pub fn new(
        execute_id: &str,
        env: Arc<ExecuteEnv>,
        services: EngineServices,
        events: EventSink,
        roots: Vec<ResultNode>,
    ) -> Self {
        let modules = Arc::new(env.scripts.clone());
        Self {
            execute_id: execute_id.to_string(),
            env,
            services,
            cancel: CancellationToken::new(),
            events,
            interactions: InteractHub::new(),
            tree: ResultTree::new(roots),
            modules,
            finished: Mutex::new(HashMap::new()),
            archived: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 可在脚本中导入的共享脚本
    pub fn modules(&self) -> Arc<HashMap<String, String>> {
        Arc::clone(&self.modules)
    }

    /// 修改节点并上报进度
    pub async fn update<F>(&self, path: &NodePath, f: F)
    where
        F: FnOnce(&mut ResultNode),
    {
        if let Some(progress) = self.tree.update(path, f).await {
            self.events.progress(progress, None);
        }
    }

    /// 节点及后代标记为跳过并上报
    pub async fn skip(&self, path: &NodePath) {
        if let Some(progress) = self.tree.skip_subtree(path).await {
            self.events.progress(progress, None);
        }
    }

    fn lock_finished(&self) -> std::sync::MutexGuard<'_, HashMap<String, Box<dyn Controller>>> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 保存执行完毕的控制器，供详情查询
    pub fn retire(&self, key: String, controller: Box<dyn Controller>) {
        self.lock_finished().insert(key, controller);
    }

    /// 已完成控制器的详情，控制器释放后从存档中读取
    pub fn detail(&self, key: &str) -> Option<Value> {
        if let Some(controller) = self.lock_finished().get(key) {
            return Some(controller.detail_result());
        }
        self.archived
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// 生成全部非空详情并释放控制器，详情另存一份供结束后的查询
    pub fn drain_details(&self) -> Vec<(String, Value)> {
        let drained: Vec<(String, Value)> = self
            .lock_finished()
            .drain()
            .map(|(key, controller)| (key, controller.detail_result()))
            .filter(|(_, detail)| !detail.is_null())
            .collect();
        self.archived
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(drained.iter().cloned());
        drained
    }
}
