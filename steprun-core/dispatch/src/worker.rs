//! 工作线程
//!
//! 每个工作线程是一个独立的 OS 线程，内部跑单线程 tokio 运行时，
//! 自己持有脚本沙箱、步骤注册表和数据源资源池。调度器只能通过
//! `WorkerTask` 与它通信，它通过 `WorkerEvent` 回报。

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use steprun_common::codec::encode_payload;
use steprun_common::{
    CallRequest, ExecuteStatus, QueryTarget, StepError, WorkerEvent, WorkerTask,
};
use steprun_executor::{
    ControllerRegistry, EngineServices, EventSink, Execution, ExecutionHandle,
};
use steprun_pool::{DataSourceRegistry, MemoryDataSource, PoolError};
use steprun_sandbox::ScriptSandbox;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{DispatchError, EngineConfig, Result};

/// 工作线程启动时构建自己的服务
pub type WorkerSetup = Arc<dyn Fn(EngineConfig) -> BoxFuture<'static, EngineServices> + Send + Sync>;

/// 默认服务：内置步骤类型 + 内存数据源
pub async fn default_services(config: EngineConfig) -> EngineServices {
    let data_sources = Arc::new(DataSourceRegistry::new());
    if let Err(e) = data_sources
        .register(Arc::new(MemoryDataSource::new(config.pool.clone())))
        .await
    {
        warn!("注册内存数据源失败: {}", e);
    }

    EngineServices::new(
        Arc::new(ScriptSandbox::new(config.sandbox.clone())),
        Arc::new(ControllerRegistry::with_builtin()),
        data_sources,
    )
}

pub(crate) fn default_setup() -> WorkerSetup {
    Arc::new(|config| default_services(config).boxed())
}

/// 工作线程发给调度器的信号
#[derive(Debug)]
pub(crate) enum WorkerSignal {
    Event(WorkerEvent),
    /// 线程已结束，附带异常原因
    Stopped(Option<String>),
}

#[derive(Debug)]
pub(crate) struct Envelope {
    pub worker: usize,
    pub signal: WorkerSignal,
}

/// 调度器一侧的工作线程句柄
pub(crate) struct Worker {
    id: usize,
    tasks: mpsc::UnboundedSender<WorkerTask>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(
        id: usize,
        config: EngineConfig,
        setup: WorkerSetup,
        outbox: mpsc::UnboundedSender<Envelope>,
    ) -> Result<Self> {
        let (tasks, inbox) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name(format!("steprun-worker-{}", id))
            .spawn(move || {
                let reason = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => {
                        let events = outbox.clone();
                        catch_unwind(AssertUnwindSafe(|| {
                            runtime.block_on(run_worker(id, config, setup, inbox, events))
                        }))
                        .err()
                        .map(|panic| panic_message(panic.as_ref()))
                    }
                    Err(e) => Some(format!("创建运行时失败: {}", e)),
                };

                if let Some(reason) = &reason {
                    error!("工作线程 {} 异常退出: {}", id, reason);
                }
                let _ = outbox.send(Envelope {
                    worker: id,
                    signal: WorkerSignal::Stopped(reason),
                });
            })
            .map_err(|e| DispatchError::WorkerSpawn(e.to_string()))?;

        Ok(Self {
            id,
            tasks,
            thread: Some(thread),
        })
    }

    pub(crate) fn send(&self, task: WorkerTask) -> Result<()> {
        self.tasks
            .send(task)
            .map_err(|_| DispatchError::WorkerGone(self.id))
    }

    /// 关闭任务通道，线程处理完手头的消息后自行退出
    pub(crate) fn close(mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}

/// 工作线程主循环
async fn run_worker(
    id: usize,
    config: EngineConfig,
    setup: WorkerSetup,
    mut inbox: mpsc::UnboundedReceiver<WorkerTask>,
    outbox: mpsc::UnboundedSender<Envelope>,
) {
    let services = setup(config.clone()).await;
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut state = WorkerState {
        id,
        services,
        executions: HashMap::new(),
        finished: VecDeque::new(),
        retain_finished: config.dispatch.retain_finished,
        events: event_tx,
        outbox,
    };

    let mut heartbeat = tokio::time::interval(config.dispatch.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("工作线程 {} 已启动", id);

    loop {
        tokio::select! {
            task = inbox.recv() => match task {
                Some(task) => state.handle(task).await,
                None => break,
            },
            Some(event) = event_rx.recv() => state.on_execution_event(event),
            _ = heartbeat.tick() => state.forward(WorkerEvent::Heartbeat {
                worker: id,
                time: Utc::now().timestamp_millis(),
            }),
        }
    }

    state.shutdown().await;
    info!("工作线程 {} 已停止", id);
}

struct WorkerState {
    id: usize,
    services: EngineServices,
    /// 本线程上的执行 (结束后在保留数量内继续可查询)
    executions: HashMap<String, ExecutionHandle>,
    /// 已结束的执行，按结束顺序
    finished: VecDeque<String>,
    retain_finished: usize,
    /// 执行与后台任务产生的事件
    events: mpsc::UnboundedSender<WorkerEvent>,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl WorkerState {
    fn forward(&self, event: WorkerEvent) {
        let _ = self.outbox.send(Envelope {
            worker: self.id,
            signal: WorkerSignal::Event(event),
        });
    }

    /// 转发执行产生的事件，执行结束时登记以便淘汰
    fn on_execution_event(&mut self, event: WorkerEvent) {
        if let WorkerEvent::Done { execute_id, .. } | WorkerEvent::Exit { execute_id, .. } = &event {
            self.retire(execute_id.clone());
        }
        self.forward(event);
    }

    /// 只保留最近结束的若干个执行句柄
    fn retire(&mut self, execute_id: String) {
        self.finished.retain(|id| id != &execute_id);
        self.finished.push_back(execute_id);
        while self.finished.len() > self.retain_finished {
            if let Some(oldest) = self.finished.pop_front() {
                debug!("工作线程 {} 释放已结束的执行 {}", self.id, oldest);
                self.executions.remove(&oldest);
            }
        }
    }

    async fn handle(&mut self, task: WorkerTask) {
        debug!("工作线程 {} 收到任务 {} ({})", self.id, task.kind(), task.request_id());
        match task {
            WorkerTask::Execute {
                env, spec, retry, ..
            } => {
                let execute_id = spec.id.clone();
                // 同一执行重试时替换旧句柄
                self.finished.retain(|id| id != &execute_id);
                let sink = EventSink::new(&execute_id, spec.mode, self.events.clone());
                let execution = Execution::new(self.services.clone(), Arc::new(env), spec, sink.clone());
                self.executions.insert(execute_id.clone(), execution.handle());

                sink.status(ExecuteStatus::Running, retry, None);
                let running = tokio::spawn(execution.run());
                tokio::spawn(async move {
                    match running.await {
                        Ok(result) => {
                            let message = result.error.as_ref().map(|e| e.message.clone());
                            sink.status(result.status, retry, message);
                            match encode_payload(&result) {
                                Ok(payload) => sink.emit(WorkerEvent::Done {
                                    execute_id,
                                    payload,
                                }),
                                Err(e) => sink.emit(WorkerEvent::Exit {
                                    execute_id,
                                    reason: format!("结果编码失败: {}", e),
                                }),
                            }
                        }
                        Err(e) => {
                            let reason = if e.is_panic() {
                                panic_message(e.into_panic().as_ref())
                            } else {
                                e.to_string()
                            };
                            error!("执行 {} 异常终止: {}", execute_id, reason);
                            sink.emit(WorkerEvent::Exit { execute_id, reason });
                        }
                    }
                });
            }

            WorkerTask::Query {
                request_id,
                execute_id,
                target,
            } => {
                let data = match self.executions.get(&execute_id) {
                    None => Err(StepError::general(format!("执行 {} 不存在", execute_id))),
                    Some(handle) => match target {
                        QueryTarget::Tree => serde_json::to_value(handle.query_tree().await)
                            .map_err(|e| StepError::system(e.to_string())),
                        QueryTarget::Detail { node } => handle
                            .query_detail(&node)
                            .await
                            .map_err(|e| StepError::general(e.to_string())),
                    },
                };
                self.forward(reply(request_id, Some(execute_id), data));
            }

            WorkerTask::Cancel {
                request_id,
                execute_id,
            } => {
                let cancelled = match self.executions.get(&execute_id) {
                    Some(handle) => {
                        handle.cancel();
                        true
                    }
                    None => false,
                };
                self.forward(reply(request_id, Some(execute_id), Ok(json!({ "cancelled": cancelled }))));
            }

            WorkerTask::Interact {
                request_id,
                execute_id,
                node,
                answer,
            } => {
                let data = match self.executions.get(&execute_id) {
                    None => Err(StepError::interact(format!("执行 {} 不存在", execute_id))),
                    Some(handle) => handle
                        .interact(&node, answer)
                        .map(|_| json!({ "accepted": true }))
                        .map_err(|e| StepError::interact(e.to_string())),
                };
                self.forward(reply(request_id, Some(execute_id), data));
            }

            WorkerTask::Call { request_id, call } => {
                let data_sources = Arc::clone(&self.services.data_sources);
                let events = self.events.clone();
                tokio::spawn(async move {
                    let data = run_call(&data_sources, call).await;
                    let _ = events.send(reply(request_id, None, data));
                });
            }
        }
    }

    async fn shutdown(&mut self) {
        for handle in self.executions.values() {
            handle.cancel();
        }
        self.services.sandbox.shutdown();
        self.services.data_sources.shutdown().await;
    }
}

fn reply(request_id: String, execute_id: Option<String>, data: std::result::Result<Value, StepError>) -> WorkerEvent {
    match data {
        Ok(data) => WorkerEvent::Reply { request_id, data },
        Err(error) => WorkerEvent::Error {
            request_id: Some(request_id),
            execute_id,
            error,
        },
    }
}

/// 执行工具调用
pub(crate) async fn run_call(
    data_sources: &DataSourceRegistry,
    call: CallRequest,
) -> std::result::Result<Value, StepError> {
    match call {
        CallRequest::TestConnection {
            source_type,
            config,
        } => data_sources
            .test_connection(&source_type, &config)
            .await
            .map_err(pool_error),
        CallRequest::DataSourceExecute {
            source_type,
            config,
            command,
        } => data_sources
            .execute(&source_type, &config, &command)
            .await
            .map(Value::Array)
            .map_err(pool_error),
    }
}

fn pool_error(error: PoolError) -> StepError {
    match error {
        PoolError::ProviderNotFound(_) | PoolError::ConfigError(_) | PoolError::Stopped => {
            StepError::system(error.to_string())
        }
        _ => StepError::execute(error.to_string()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "未知 panic".to_string())
}
