//! 批次调度
//!
//! 协调任务独占全部调度状态：等待队列、运行中的执行、工作线程和挂起的请求。
//! 外部通过 [`DispatchHandle`] 发命令，通过 [`BatchRun::reports`] 逐个拿到执行结果。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle as ThreadHandle;
use std::time::Duration;
use steprun_common::codec::decode_payload;
use steprun_common::{
    Batch, CallRequest, ExecuteEnv, ExecuteSpec, ExecuteStatus, ExecutionResult, QueryTarget,
    WorkerEvent, WorkerTask,
};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::worker::{default_setup, Envelope, Worker, WorkerSignal};
use crate::{DispatchError, EngineConfig, Result, WorkerSetup};

/// 单个执行的最终报告
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub execute_id: String,
    pub status: ExecuteStatus,
    pub retry: u32,
    /// 非正常结束的原因
    pub reason: Option<String>,
    /// 工作线程回传的完整结果 (异常退出时没有)
    pub result: Option<ExecutionResult>,
}

impl ExecutionReport {
    fn without_result(execute_id: &str, status: ExecuteStatus, retry: u32, reason: impl Into<String>) -> Self {
        Self {
            execute_id: execute_id.to_string(),
            status,
            retry,
            reason: Some(reason.into()),
            result: None,
        }
    }

    pub fn entry(&self) -> SummaryEntry {
        SummaryEntry {
            execute_id: self.execute_id.clone(),
            status: self.status,
            retry: self.retry,
            total_time: self.result.as_ref().map(|r| r.total_time).unwrap_or(0),
            reason: self.reason.clone(),
        }
    }
}

/// 汇总中的一项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryEntry {
    pub execute_id: String,
    pub status: ExecuteStatus,
    pub retry: u32,
    pub total_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// 批次完成汇总
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    /// 各终态的数量
    pub counts: BTreeMap<String, usize>,
    pub executions: Vec<SummaryEntry>,
}

impl BatchSummary {
    /// 汇总并校正：最后状态仍是 WAIT/RUNNING 的执行一律记为 EXIT
    pub fn new(entries: Vec<SummaryEntry>) -> Self {
        let executions: Vec<SummaryEntry> = entries
            .into_iter()
            .map(|mut entry| {
                if !entry.status.is_terminal() {
                    warn!("执行 {} 最后状态为 {}，记为 EXIT", entry.execute_id, entry.status);
                    entry.reason.get_or_insert_with(|| format!("结束时仍为 {}", entry.status));
                    entry.status = ExecuteStatus::Exit;
                }
                entry
            })
            .collect();

        let mut counts = BTreeMap::new();
        for entry in &executions {
            *counts.entry(entry.status.to_string()).or_insert(0) += 1;
        }

        Self {
            total: executions.len(),
            counts,
            executions,
        }
    }

    pub fn count(&self, status: ExecuteStatus) -> usize {
        self.counts.get(&status.to_string()).copied().unwrap_or(0)
    }
}

enum RequestKind {
    Query(QueryTarget),
    Interact { node: String, answer: Value },
    Call(CallRequest),
}

enum Command {
    /// `None` 表示取消全部
    Cancel(Option<String>),
    Request {
        execute_id: Option<String>,
        kind: RequestKind,
        reply: oneshot::Sender<Result<Value>>,
    },
    Shutdown,
}

/// 调度中批次的控制句柄
#[derive(Clone)]
pub struct DispatchHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl DispatchHandle {
    /// 取消一个执行，排队中的直接记为 CANCELLED；可重复调用
    pub fn cancel(&self, execute_id: &str) {
        let _ = self.commands.send(Command::Cancel(Some(execute_id.to_string())));
    }

    /// 取消全部执行，不再启动新的执行
    pub fn cancel_all(&self) {
        let _ = self.commands.send(Command::Cancel(None));
    }

    /// 立即结束调度，仍在运行的执行记为 EXIT
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// 查询结果树或单个步骤详情
    pub async fn query(&self, execute_id: &str, target: QueryTarget) -> Result<Value> {
        self.request(Some(execute_id), RequestKind::Query(target)).await
    }

    /// 向等待交互的步骤提交输入
    pub async fn interact(&self, execute_id: &str, node: &str, answer: Value) -> Result<Value> {
        self.request(
            Some(execute_id),
            RequestKind::Interact {
                node: node.to_string(),
                answer,
            },
        )
        .await
    }

    /// 工具调用，由负载最低的工作线程处理
    pub async fn call(&self, call: CallRequest) -> Result<Value> {
        self.request(None, RequestKind::Call(call)).await
    }

    async fn request(&self, execute_id: Option<&str>, kind: RequestKind) -> Result<Value> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Request {
                execute_id: execute_id.map(str::to_string),
                kind,
                reply,
            })
            .map_err(|_| DispatchError::Closed)?;
        answer.await.map_err(|_| DispatchError::Closed)?
    }
}

/// 正在调度的批次
pub struct BatchRun {
    pub handle: DispatchHandle,
    /// 每个执行结束时产出一份报告，全部结束后通道关闭
    pub reports: mpsc::UnboundedReceiver<ExecutionReport>,
    summary: JoinHandle<BatchSummary>,
}

impl BatchRun {
    /// 等待批次结束
    pub async fn wait(self) -> Result<BatchSummary> {
        self.summary.await.map_err(|e| {
            error!("调度任务异常结束: {}", e);
            DispatchError::Closed
        })
    }
}

/// 批次调度器
pub struct Dispatcher {
    config: EngineConfig,
    setup: WorkerSetup,
    observer: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

impl Dispatcher {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            setup: default_setup(),
            observer: None,
        }
    }

    /// 自定义工作线程的服务构建 (注册插件步骤类型和数据源)
    pub fn with_setup(mut self, setup: WorkerSetup) -> Self {
        self.setup = setup;
        self
    }

    /// 旁路接收工作线程的状态、进度和日志事件
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 启动批次调度，需要在 tokio 运行时中调用
    pub fn run_batch(self, batch: Batch) -> Result<BatchRun> {
        let (outbox, events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (reports_tx, reports) = mpsc::unbounded_channel();

        let order = batch.executions.iter().map(|e| e.id.clone()).collect();
        let mut coordinator = Coordinator {
            permits: Arc::new(Semaphore::new(self.config.dispatch.concurrency())),
            config: self.config,
            setup: self.setup,
            env: batch.env,
            outbox,
            workers: BTreeMap::new(),
            next_worker: 0,
            queue: batch
                .executions
                .into_iter()
                .map(|spec| Queued { spec, retry: 0 })
                .collect(),
            running: HashMap::new(),
            placed: HashMap::new(),
            pending: HashMap::new(),
            entries: HashMap::new(),
            order,
            cancelling: false,
            reports: reports_tx,
            observer: self.observer,
        };

        let worker_count = coordinator.config.dispatch.worker_count();
        for _ in 0..worker_count {
            coordinator.spawn_worker()?;
        }
        info!(
            "批次开始: {} 个执行, {} 个工作线程, 并发上限 {}",
            coordinator.queue.len(),
            worker_count,
            coordinator.config.dispatch.concurrency()
        );

        let summary = tokio::spawn(coordinator.run(events, commands));
        Ok(BatchRun {
            handle: DispatchHandle {
                commands: commands_tx,
            },
            reports,
            summary,
        })
    }

    /// 不经过批次，直接在一个临时工作线程上完成工具调用
    pub async fn call(self, call: CallRequest) -> Result<Value> {
        let (outbox, mut events) = mpsc::unbounded_channel();
        let worker = Worker::spawn(0, self.config, self.setup, outbox)?;
        let request_id = Uuid::new_v4().to_string();
        worker.send(WorkerTask::Call {
            request_id: request_id.clone(),
            call,
        })?;

        let outcome = loop {
            match events.recv().await.map(|e| e.signal) {
                Some(WorkerSignal::Event(event)) if event.request_id() == Some(request_id.as_str()) => {
                    break into_reply(event)
                }
                Some(WorkerSignal::Stopped(_)) => break Err(DispatchError::WorkerGone(0)),
                Some(_) => continue,
                None => break Err(DispatchError::Closed),
            }
        };
        drop(worker.close());
        outcome
    }
}

fn into_reply(event: WorkerEvent) -> Result<Value> {
    match event {
        WorkerEvent::Reply { data, .. } => Ok(data),
        WorkerEvent::Error { error, .. } => Err(DispatchError::Request(error)),
        _ => Err(DispatchError::Closed),
    }
}

struct WorkerSlot {
    worker: Worker,
    last_seen: Instant,
    load: usize,
}

struct Queued {
    spec: ExecuteSpec,
    retry: u32,
}

struct Running {
    spec: ExecuteSpec,
    worker: usize,
    retry: u32,
    status: ExecuteStatus,
    deadline: Option<Instant>,
    /// 超时后发出取消的时间
    timed_out: Option<Instant>,
    _permit: OwnedSemaphorePermit,
}

struct Pending {
    worker: usize,
    reply: oneshot::Sender<Result<Value>>,
}

struct Coordinator {
    config: EngineConfig,
    /// 全局并发上限
    permits: Arc<Semaphore>,
    setup: WorkerSetup,
    env: ExecuteEnv,
    outbox: mpsc::UnboundedSender<Envelope>,
    workers: BTreeMap<usize, WorkerSlot>,
    next_worker: usize,
    queue: VecDeque<Queued>,
    running: HashMap<String, Running>,
    /// 已结束执行所在的工作线程，供结束后的查询使用
    placed: HashMap<String, usize>,
    pending: HashMap<String, Pending>,
    entries: HashMap<String, SummaryEntry>,
    order: Vec<String>,
    cancelling: bool,
    reports: mpsc::UnboundedSender<ExecutionReport>,
    observer: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Envelope>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) -> BatchSummary {
        let mut ticker = tokio::time::interval(self.config.dispatch.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        self.fill();
        while !self.is_idle() {
            tokio::select! {
                Some(envelope) = events.recv() => self.on_envelope(envelope),
                command = commands.recv(), if commands_open => match command {
                    Some(Command::Shutdown) => {
                        warn!("调度器收到关闭命令");
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => commands_open = false,
                },
                _ = ticker.tick() => self.on_tick(),
            }
            self.fill();
        }

        self.finish().await
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }

    fn spawn_worker(&mut self) -> Result<usize> {
        let id = self.next_worker;
        self.next_worker += 1;
        let worker = Worker::spawn(id, self.config.clone(), Arc::clone(&self.setup), self.outbox.clone())?;
        self.workers.insert(
            id,
            WorkerSlot {
                worker,
                last_seen: Instant::now(),
                load: 0,
            },
        );
        debug!("工作线程 {} 已创建", id);
        Ok(id)
    }

    fn least_loaded(&self) -> Option<usize> {
        self.workers
            .iter()
            .min_by_key(|(_, slot)| slot.load)
            .map(|(id, _)| *id)
    }

    /// 当前没有执行的工作线程
    fn idle_worker(&self) -> Option<usize> {
        self.workers
            .iter()
            .find(|(_, slot)| slot.load == 0)
            .map(|(id, _)| *id)
    }

    /// 在并发上限内启动排队的执行
    fn fill(&mut self) {
        while !self.queue.is_empty() {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let Some(worker_id) = self.idle_worker() else {
                trace!("没有空闲的工作线程，{} 个执行排队中", self.queue.len());
                break;
            };
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            self.start(worker_id, queued, permit);
        }
    }

    fn start(&mut self, worker_id: usize, queued: Queued, permit: OwnedSemaphorePermit) {
        let Queued { spec, retry } = queued;
        let Some(slot) = self.workers.get_mut(&worker_id) else {
            return;
        };

        let timeout = spec
            .timeout
            .map(Duration::from_millis)
            .or_else(|| self.config.dispatch.timeout());
        let task = WorkerTask::Execute {
            request_id: Uuid::new_v4().to_string(),
            env: self.env.clone(),
            spec: spec.clone(),
            retry,
        };
        if let Err(e) = slot.worker.send(task) {
            warn!("下发执行 {} 失败: {}", spec.id, e);
            self.queue.push_front(Queued { spec, retry });
            self.replace_worker(worker_id, "任务通道已关闭".to_string());
            return;
        }

        slot.load += 1;
        info!("执行 {} 分配到工作线程 {} (重试 {})", spec.id, worker_id, retry);
        self.running.insert(
            spec.id.clone(),
            Running {
                spec,
                worker: worker_id,
                retry,
                status: ExecuteStatus::Wait,
                deadline: timeout.map(|t| Instant::now() + t),
                timed_out: None,
                _permit: permit,
            },
        );
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        let Envelope { worker, signal } = envelope;
        let Some(slot) = self.workers.get_mut(&worker) else {
            trace!("忽略已移除工作线程 {} 的消息", worker);
            return;
        };
        slot.last_seen = Instant::now();

        match signal {
            WorkerSignal::Stopped(reason) => {
                self.replace_worker(worker, reason.unwrap_or_else(|| "工作线程已退出".to_string()))
            }
            WorkerSignal::Event(event) => self.on_event(worker, event),
        }
    }

    fn on_event(&mut self, worker: usize, event: WorkerEvent) {
        if let Some(observer) = &self.observer {
            if !matches!(event, WorkerEvent::Heartbeat { .. }) {
                let _ = observer.send(event.clone());
            }
        }

        if let Some(request_id) = event.request_id().map(str::to_string) {
            if let Some(pending) = self.pending.remove(&request_id) {
                let _ = pending.reply.send(into_reply(event));
            }
            return;
        }

        match event {
            WorkerEvent::Status {
                execute_id,
                status,
                retry,
                ..
            } => {
                if let Some(run) = self.running.get_mut(&execute_id) {
                    if run.worker == worker && run.retry == retry {
                        debug!("执行 {} 状态: {}", execute_id, status);
                        run.status = status;
                    }
                }
            }
            WorkerEvent::Done {
                execute_id,
                payload,
            } => self.complete(worker, &execute_id, &payload),
            WorkerEvent::Exit { execute_id, reason } => self.crashed(worker, &execute_id, reason),
            WorkerEvent::Error {
                execute_id, error, ..
            } => warn!("执行 {:?} 报告错误: {}", execute_id, error.message),
            WorkerEvent::Heartbeat { .. }
            | WorkerEvent::Progress { .. }
            | WorkerEvent::Log { .. }
            | WorkerEvent::Reply { .. } => {}
        }
    }

    fn take_running(&mut self, worker: usize, execute_id: &str) -> Option<Running> {
        if self.running.get(execute_id)?.worker != worker {
            return None;
        }
        let run = self.running.remove(execute_id)?;
        if let Some(slot) = self.workers.get_mut(&worker) {
            slot.load = slot.load.saturating_sub(1);
        }
        self.placed.insert(execute_id.to_string(), worker);
        Some(run)
    }

    fn complete(&mut self, worker: usize, execute_id: &str, payload: &[u8]) {
        let Some(run) = self.take_running(worker, execute_id) else {
            return;
        };

        let mut result = match decode_payload::<ExecutionResult>(payload) {
            Ok(result) => Some(result),
            Err(e) => {
                error!("执行 {} 结果解码失败: {}", execute_id, e);
                None
            }
        };

        let status = match (&run.timed_out, &result) {
            (Some(_), _) => ExecuteStatus::Timeout,
            (None, Some(result)) => result.status,
            (None, None) => ExecuteStatus::Error,
        };
        let reason = match (&run.timed_out, &result) {
            (Some(_), _) => Some("执行超时".to_string()),
            (None, Some(result)) => result.error.as_ref().map(|e| e.message.clone()),
            (None, None) => Some("结果解码失败".to_string()),
        };
        if let Some(result) = result.as_mut() {
            result.status = status;
            result.retry = run.retry;
        }

        self.report(ExecutionReport {
            execute_id: execute_id.to_string(),
            status,
            retry: run.retry,
            reason,
            result,
        });
    }

    /// 执行异常退出，按重试次数重新排队
    fn crashed(&mut self, worker: usize, execute_id: &str, reason: String) {
        let Some(run) = self.take_running(worker, execute_id) else {
            return;
        };

        let max_retry = run.spec.retry.unwrap_or(self.config.dispatch.retry);
        if run.timed_out.is_none() && !self.cancelling && run.retry < max_retry {
            warn!(
                "执行 {} 异常退出 ({})，第 {}/{} 次重试",
                execute_id,
                reason,
                run.retry + 1,
                max_retry
            );
            self.queue.push_front(Queued {
                spec: run.spec,
                retry: run.retry + 1,
            });
        } else {
            error!("执行 {} 异常退出: {}", execute_id, reason);
            let status = if run.timed_out.is_some() {
                ExecuteStatus::Timeout
            } else {
                ExecuteStatus::Exit
            };
            self.report(ExecutionReport::without_result(execute_id, status, run.retry, reason));
        }
    }

    /// 移除失联或退出的工作线程，其上的执行按异常退出处理，并补充新的工作线程
    fn replace_worker(&mut self, worker: usize, reason: String) {
        let Some(slot) = self.workers.remove(&worker) else {
            return;
        };
        warn!("移除工作线程 {}: {}", worker, reason);
        drop(slot.worker.close());

        let orphaned: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.worker == worker)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in orphaned {
            if let Some(pending) = self.pending.remove(&request_id) {
                let _ = pending.reply.send(Err(DispatchError::WorkerGone(worker)));
            }
        }

        let affected: Vec<String> = self
            .running
            .iter()
            .filter(|(_, run)| run.worker == worker)
            .map(|(id, _)| id.clone())
            .collect();
        for execute_id in affected {
            self.crashed(worker, &execute_id, reason.clone());
        }

        if let Err(e) = self.spawn_worker() {
            error!("补充工作线程失败: {}", e);
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let grace = self.config.dispatch.heartbeat_deadline();

        let expired: Vec<(String, usize)> = self
            .running
            .iter_mut()
            .filter(|(_, run)| run.timed_out.is_none() && run.deadline.is_some_and(|d| now >= d))
            .map(|(id, run)| {
                run.timed_out = Some(now);
                (id.clone(), run.worker)
            })
            .collect();
        for (execute_id, worker) in expired {
            warn!("执行 {} 超时，发送取消", execute_id);
            self.send_cancel(worker, &execute_id);
        }

        let abandoned: Vec<(String, usize)> = self
            .running
            .iter()
            .filter(|(_, run)| run.timed_out.is_some_and(|t| now.duration_since(t) >= grace))
            .map(|(id, run)| (id.clone(), run.worker))
            .collect();
        for (execute_id, worker) in abandoned {
            if let Some(run) = self.take_running(worker, &execute_id) {
                error!("执行 {} 取消后仍未结束，放弃等待", execute_id);
                self.report(ExecutionReport::without_result(
                    &execute_id,
                    ExecuteStatus::Timeout,
                    run.retry,
                    "执行超时且未响应取消",
                ));
                // 执行仍占着这个工作线程，换一个新的
                self.replace_worker(worker, "执行超时且未响应取消".to_string());
            }
        }

        let silent: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.last_seen) >= grace)
            .map(|(id, _)| *id)
            .collect();
        for worker in silent {
            self.replace_worker(worker, "心跳超时".to_string());
        }
    }

    fn send_cancel(&self, worker: usize, execute_id: &str) {
        if let Some(slot) = self.workers.get(&worker) {
            let task = WorkerTask::Cancel {
                request_id: Uuid::new_v4().to_string(),
                execute_id: execute_id.to_string(),
            };
            if let Err(e) = slot.worker.send(task) {
                warn!("取消执行 {} 失败: {}", execute_id, e);
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Cancel(Some(execute_id)) => {
                if let Some(pos) = self.queue.iter().position(|q| q.spec.id == execute_id) {
                    if let Some(queued) = self.queue.remove(pos) {
                        self.report(ExecutionReport::without_result(
                            &execute_id,
                            ExecuteStatus::Cancelled,
                            queued.retry,
                            "排队中被取消",
                        ));
                    }
                } else if let Some(worker) = self.running.get(&execute_id).map(|r| r.worker) {
                    info!("取消执行 {}", execute_id);
                    self.send_cancel(worker, &execute_id);
                } else {
                    debug!("执行 {} 不在运行中，忽略取消", execute_id);
                }
            }
            Command::Cancel(None) => {
                if !self.cancelling {
                    info!("取消全部执行");
                }
                self.cancelling = true;
                while let Some(queued) = self.queue.pop_front() {
                    self.report(ExecutionReport::without_result(
                        &queued.spec.id,
                        ExecuteStatus::Cancelled,
                        queued.retry,
                        "排队中被取消",
                    ));
                }
                let targets: Vec<(String, usize)> = self
                    .running
                    .iter()
                    .map(|(id, run)| (id.clone(), run.worker))
                    .collect();
                for (execute_id, worker) in targets {
                    self.send_cancel(worker, &execute_id);
                }
            }
            Command::Request {
                execute_id,
                kind,
                reply,
            } => self.forward_request(execute_id, kind, reply),
            Command::Shutdown => {}
        }
    }

    fn forward_request(
        &mut self,
        execute_id: Option<String>,
        kind: RequestKind,
        reply: oneshot::Sender<Result<Value>>,
    ) {
        let worker = match &execute_id {
            Some(id) => self
                .running
                .get(id)
                .map(|run| run.worker)
                .or_else(|| self.placed.get(id).copied())
                .filter(|worker| self.workers.contains_key(worker)),
            None => self.least_loaded(),
        };
        let Some(worker) = worker else {
            let _ = reply.send(Err(DispatchError::NotRunning(execute_id.unwrap_or_default())));
            return;
        };

        let request_id = Uuid::new_v4().to_string();
        let execute_id = execute_id.unwrap_or_default();
        let task = match kind {
            RequestKind::Query(target) => WorkerTask::Query {
                request_id: request_id.clone(),
                execute_id,
                target,
            },
            RequestKind::Interact { node, answer } => WorkerTask::Interact {
                request_id: request_id.clone(),
                execute_id,
                node,
                answer,
            },
            RequestKind::Call(call) => WorkerTask::Call {
                request_id: request_id.clone(),
                call,
            },
        };

        let sent = self
            .workers
            .get(&worker)
            .map(|slot| slot.worker.send(task))
            .unwrap_or(Err(DispatchError::WorkerGone(worker)));
        match sent {
            Ok(()) => {
                self.pending.insert(request_id, Pending { worker, reply });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn report(&mut self, report: ExecutionReport) {
        info!(
            "执行 {} 结束: {} (重试 {})",
            report.execute_id, report.status, report.retry
        );
        self.entries.insert(report.execute_id.clone(), report.entry());
        let _ = self.reports.send(report);
    }

    async fn finish(mut self) -> BatchSummary {
        for (execute_id, run) in self.running.drain() {
            warn!("调度结束时执行 {} 仍为 {}", execute_id, run.status);
            self.entries.insert(
                execute_id.clone(),
                SummaryEntry {
                    execute_id,
                    status: run.status,
                    retry: run.retry,
                    total_time: 0,
                    reason: Some("调度器关闭时仍在运行".to_string()),
                },
            );
        }
        while let Some(queued) = self.queue.pop_front() {
            self.entries.insert(
                queued.spec.id.clone(),
                SummaryEntry {
                    execute_id: queued.spec.id,
                    status: ExecuteStatus::Cancelled,
                    retry: queued.retry,
                    total_time: 0,
                    reason: Some("调度器关闭时仍在排队".to_string()),
                },
            );
        }
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(DispatchError::Closed));
        }

        let threads: Vec<ThreadHandle<()>> = std::mem::take(&mut self.workers)
            .into_values()
            .filter_map(|slot| slot.worker.close())
            .collect();
        let grace = self.config.dispatch.heartbeat_deadline();
        for thread in threads {
            let joined = tokio::time::timeout(grace, tokio::task::spawn_blocking(move || thread.join())).await;
            if joined.is_err() {
                warn!("等待工作线程退出超时");
            }
        }

        let entries = self
            .order
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect();
        let summary = BatchSummary::new(entries);
        info!("批次结束: {:?}", summary.counts);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, status: ExecuteStatus) -> SummaryEntry {
        SummaryEntry {
            execute_id: id.to_string(),
            status,
            retry: 0,
            total_time: 0,
            reason: None,
        }
    }

    #[test]
    fn test_summary_reconciles_running_to_exit() {
        let summary = BatchSummary::new(vec![
            entry("a", ExecuteStatus::Done),
            entry("b", ExecuteStatus::Running),
            entry("c", ExecuteStatus::Wait),
            entry("d", ExecuteStatus::Timeout),
        ]);

        assert_eq!(summary.total, 4);
        assert_eq!(summary.count(ExecuteStatus::Done), 1);
        assert_eq!(summary.count(ExecuteStatus::Exit), 2);
        assert_eq!(summary.count(ExecuteStatus::Timeout), 1);
        assert_eq!(summary.count(ExecuteStatus::Running), 0);
        assert!(summary.executions[1].reason.as_deref().unwrap().contains("RUNNING"));
    }

    #[test]
    fn test_summary_wire_format() {
        let summary = BatchSummary::new(vec![entry("a", ExecuteStatus::Done)]);
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["total"], 1);
        assert_eq!(value["executions"][0]["executeId"], "a");
        assert_eq!(value["counts"]["DONE"], 1);
    }
}
