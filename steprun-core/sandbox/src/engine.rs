//! 脚本沙箱

use rhai::{Dynamic, Engine, EvalAltResult, ParseError, Position, Scope};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use steprun_common::{LogEntry, LogLevel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::console::{self, Console, LogSink};
use crate::context::{self, Interruption, RunControl, ScriptBindings, ScriptContext};
use crate::decycle::{json_to_dynamic, to_json};
use crate::modules::AllowListResolver;
use crate::{Result, SandboxConfig, SandboxError};

/// 单次脚本执行请求
pub struct ScriptRequest {
    pub bindings: ScriptBindings,

    /// 以常量形式注入的值 (例如后置脚本中的 `result`)
    pub constants: Vec<(String, Value)>,

    /// 可导入的共享脚本
    pub modules: Arc<HashMap<String, String>>,

    /// 覆盖默认超时
    pub timeout: Option<Duration>,

    pub cancel: CancellationToken,

    pub log_sink: Option<LogSink>,
}

impl ScriptRequest {
    pub fn new(bindings: ScriptBindings) -> Self {
        Self {
            bindings,
            constants: Vec::new(),
            modules: Arc::new(HashMap::new()),
            timeout: None,
            cancel: CancellationToken::new(),
            log_sink: None,
        }
    }

    pub fn with_constant(mut self, name: &str, value: Value) -> Self {
        self.constants.push((name.to_string(), value));
        self
    }

    pub fn with_modules(mut self, modules: Arc<HashMap<String, String>>) -> Self {
        self.modules = modules;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }
}

/// 脚本执行结果
///
/// 无论成功与否都带回上下文变量和已捕获的日志。
#[derive(Debug)]
pub struct ScriptRun {
    pub result: Result<Value>,
    pub context: Map<String, Value>,
    pub logs: Vec<LogEntry>,
    pub elapsed: Duration,
}

/// 脚本沙箱
///
/// 归工作线程所有。`shutdown` 之后所有执行中的脚本会在下一个检查点中止，
/// 新的执行请求直接失败。
pub struct ScriptSandbox {
    config: SandboxConfig,
    inflight: Mutex<HashMap<u64, Arc<AtomicU8>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ScriptSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// 执行中的脚本数量
    pub fn inflight(&self) -> usize {
        self.lock_inflight().len()
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<AtomicU8>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 执行一段脚本
    pub async fn run(&self, source: &str, request: ScriptRequest) -> ScriptRun {
        let started = Instant::now();
        if self.closed.load(Ordering::SeqCst) {
            return ScriptRun {
                result: Err(SandboxError::Shutdown),
                context: request.bindings.context,
                logs: Vec::new(),
                elapsed: Duration::ZERO,
            };
        }

        let timeout = request.timeout.unwrap_or_else(|| self.config.timeout());
        let timeout_ms = timeout.as_millis() as u64;
        let control = RunControl::new(timeout, request.cancel.clone());
        let abort = control.abort_handle();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock_inflight().insert(id, Arc::clone(&abort));

        let console = Console::new(request.log_sink.clone());
        let context = ScriptContext::new(request.bindings, control.clone(), self.config.allow_process);
        let job = ScriptJob {
            source: source.to_string(),
            constants: request.constants,
            modules: request.modules,
            config: self.config.clone(),
            control,
            console: console.clone(),
            context: context.clone(),
            timeout_ms,
        };

        debug!("执行脚本 #{} (超时 {}ms)", id, timeout_ms);
        let handle = tokio::task::spawn_blocking(move || job.run());
        let result = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SandboxError::Internal(e.to_string())),
            Err(_) => {
                RunControl::abort_timeout(&abort);
                warn!("脚本 #{} 执行超时 ({}ms)", id, timeout_ms);
                Err(SandboxError::Timeout(timeout_ms))
            }
        };

        self.lock_inflight().remove(&id);

        ScriptRun {
            result,
            context: context.snapshot(),
            logs: console.take(),
            elapsed: started.elapsed(),
        }
    }

    /// 关闭沙箱，中止所有执行中的脚本
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let inflight = self.lock_inflight();
        for abort in inflight.values() {
            RunControl::abort_shutdown(abort);
        }
        debug!("脚本沙箱已关闭，中止 {} 个执行中的脚本", inflight.len());
    }
}

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

/// 在阻塞线程中运行的脚本任务
struct ScriptJob {
    source: String,
    constants: Vec<(String, Value)>,
    modules: Arc<HashMap<String, String>>,
    config: SandboxConfig,
    control: RunControl,
    console: Console,
    context: ScriptContext,
    timeout_ms: u64,
}

impl ScriptJob {
    fn run(self) -> Result<Value> {
        let engine = build_engine(&self.config, self.control, self.console.clone(), self.modules);

        let mut scope = Scope::new();
        scope.push("ctx", self.context);
        scope.push("console", self.console);
        for (name, value) in &self.constants {
            scope.push_constant(name.clone(), json_to_dynamic(value));
        }

        let ast = engine.compile(&self.source).map_err(parse_error)?;
        engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map(|value| to_json(&value))
            .map_err(|e| classify(e, self.timeout_ms))
    }
}

fn build_engine(
    config: &SandboxConfig,
    control: RunControl,
    console: Console,
    modules: Arc<HashMap<String, String>>,
) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_call_levels(config.max_call_levels);
    engine.set_max_modules(config.max_modules);
    engine.set_module_resolver(AllowListResolver::new(modules));

    engine.on_progress(move |_| control.interruption().map(|r| Dynamic::from(r.token())));

    let printer = console.clone();
    engine.on_print(move |text| printer.write_text(LogLevel::Info, text));
    engine.on_debug(move |text, _source, _pos| console.write_text(LogLevel::Debug, text));

    console::register(&mut engine);
    context::register(&mut engine);
    engine
}

fn parse_error(error: ParseError) -> SandboxError {
    let position = error.position();
    SandboxError::Script {
        message: format!("语法错误: {}", error.err_type()),
        line: position.line(),
        column: position.position(),
        stack: None,
    }
}

fn frame(name: &str, pos: Position) -> String {
    match (pos.line(), pos.position()) {
        (Some(line), Some(column)) => format!("at {} (line {}, column {})", name, line, column),
        (Some(line), None) => format!("at {} (line {})", name, line),
        _ => format!("at {}", name),
    }
}

/// 将 rhai 错误转换为沙箱错误
///
/// 逐层展开函数调用和模块错误，最内层错误的位置即脚本中的出错位置，
/// 外层调用点组成调用栈。
fn classify(error: Box<EvalAltResult>, timeout_ms: u64) -> SandboxError {
    let mut frames = Vec::new();
    let mut current = error;
    let innermost = loop {
        current = match *current {
            EvalAltResult::ErrorInFunctionCall(name, _source, inner, pos) => {
                frames.push(frame(&name, pos));
                inner
            }
            EvalAltResult::ErrorInModule(name, inner, pos) => {
                frames.push(frame(&format!("import \"{}\"", name), pos));
                inner
            }
            other => break other,
        };
    };

    let stack = if frames.is_empty() {
        None
    } else {
        frames.reverse();
        Some(frames.join("\n"))
    };

    match innermost {
        EvalAltResult::ErrorTerminated(token, _) => {
            match Interruption::from_token(&token.to_string()) {
                Some(Interruption::Timeout) => SandboxError::Timeout(timeout_ms),
                Some(Interruption::Cancelled) => SandboxError::Cancelled,
                Some(Interruption::Shutdown) => SandboxError::Shutdown,
                None => SandboxError::Internal(format!("脚本被中止: {}", token)),
            }
        }
        EvalAltResult::ErrorModuleNotFound(name, _) => SandboxError::ModuleNotFound(name),
        EvalAltResult::ErrorRuntime(value, pos) => {
            let message = value
                .clone()
                .into_string()
                .unwrap_or_else(|_| to_json(&value).to_string());
            SandboxError::Script {
                message,
                line: pos.line(),
                column: pos.position(),
                stack,
            }
        }
        mut other => {
            let pos = other.take_position();
            SandboxError::Script {
                message: other.to_string(),
                line: pos.line(),
                column: pos.position(),
                stack,
            }
        }
    }
}
