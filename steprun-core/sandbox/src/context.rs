//! 脚本中的 `ctx` 对象

use rhai::{Dynamic, Engine, EvalAltResult, Position, INT};
use serde_json::{Map, Value};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::decycle::{json_to_dynamic, to_json};

/// 跨步骤共享的变量层 (用例局部、全局、环境变量覆盖)
pub type SharedVariables = Arc<RwLock<Map<String, Value>>>;

/// 脚本可见的变量
#[derive(Debug, Clone, Default)]
pub struct ScriptBindings {
    /// 上下文局部变量 (脚本结束后写回调用方)
    pub context: Map<String, Value>,
    pub local: SharedVariables,
    pub global: SharedVariables,
    /// 环境变量覆盖层，未命中时读取进程环境变量
    pub env: SharedVariables,
}

impl ScriptBindings {
    /// 按 上下文 > 局部 > 全局 的顺序解析变量
    pub fn resolve(&self, name: &str) -> Option<Value> {
        self.context
            .get(name)
            .cloned()
            .or_else(|| read(&self.local).get(name).cloned())
            .or_else(|| read(&self.global).get(name).cloned())
    }
}

/// 读锁 (忽略中毒)
pub fn read(vars: &SharedVariables) -> std::sync::RwLockReadGuard<'_, Map<String, Value>> {
    vars.read().unwrap_or_else(PoisonError::into_inner)
}

/// 写锁 (忽略中毒)
pub fn write(vars: &SharedVariables) -> std::sync::RwLockWriteGuard<'_, Map<String, Value>> {
    vars.write().unwrap_or_else(PoisonError::into_inner)
}

/// 读取环境变量：先查覆盖层，再查进程环境
pub fn env_var(overlay: &SharedVariables, name: &str) -> Option<String> {
    match read(overlay).get(name) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) => None,
        Some(other) => Some(other.to_string()),
        None => std::env::var(name).ok(),
    }
}

/// 中断原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interruption {
    Timeout,
    Cancelled,
    Shutdown,
}

impl Interruption {
    pub(crate) fn token(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
        }
    }

    pub(crate) fn from_token(token: &str) -> Option<Self> {
        match token {
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }

    pub(crate) fn into_error(self) -> Box<EvalAltResult> {
        EvalAltResult::ErrorTerminated(Dynamic::from(self.token()), Position::NONE).into()
    }
}

const ABORT_NONE: u8 = 0;
const ABORT_TIMEOUT: u8 = 1;
const ABORT_SHUTDOWN: u8 = 2;

/// 单段脚本的中断控制
///
/// 由 on_progress 钩子和 `ctx.sleep` 轮询。
#[derive(Clone)]
pub(crate) struct RunControl {
    abort: Arc<AtomicU8>,
    deadline: Instant,
    cancel: CancellationToken,
}

impl RunControl {
    pub(crate) fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            abort: Arc::new(AtomicU8::new(ABORT_NONE)),
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    pub(crate) fn abort_handle(&self) -> Arc<AtomicU8> {
        Arc::clone(&self.abort)
    }

    pub(crate) fn abort_timeout(handle: &AtomicU8) {
        let _ = handle.compare_exchange(ABORT_NONE, ABORT_TIMEOUT, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub(crate) fn abort_shutdown(handle: &AtomicU8) {
        handle.store(ABORT_SHUTDOWN, Ordering::SeqCst);
    }

    pub(crate) fn interruption(&self) -> Option<Interruption> {
        match self.abort.load(Ordering::SeqCst) {
            ABORT_TIMEOUT => return Some(Interruption::Timeout),
            ABORT_SHUTDOWN => return Some(Interruption::Shutdown),
            _ => {}
        }
        if self.cancel.is_cancelled() {
            return Some(Interruption::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Some(Interruption::Timeout);
        }
        None
    }
}

/// 脚本中的 `ctx` 对象
#[derive(Clone)]
pub struct ScriptContext {
    context: Arc<Mutex<Map<String, Value>>>,
    local: SharedVariables,
    global: SharedVariables,
    env: SharedVariables,
    control: RunControl,
    allow_process: bool,
}

impl ScriptContext {
    pub(crate) fn new(bindings: ScriptBindings, control: RunControl, allow_process: bool) -> Self {
        Self {
            context: Arc::new(Mutex::new(bindings.context)),
            local: bindings.local,
            global: bindings.global,
            env: bindings.env,
            control,
            allow_process,
        }
    }

    /// 当前的上下文局部变量
    pub(crate) fn snapshot(&self) -> Map<String, Value> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn context_vars(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&mut self, name: &str) -> Dynamic {
        let value = self
            .context_vars()
            .get(name)
            .cloned()
            .or_else(|| read(&self.local).get(name).cloned())
            .or_else(|| read(&self.global).get(name).cloned());
        value.map(|v| json_to_dynamic(&v)).unwrap_or(Dynamic::UNIT)
    }

    fn set(&mut self, name: &str, value: Dynamic) {
        self.context_vars().insert(name.to_string(), to_json(&value));
    }

    fn remove(&mut self, name: &str) -> Dynamic {
        self.context_vars()
            .remove(name)
            .map(|v| json_to_dynamic(&v))
            .unwrap_or(Dynamic::UNIT)
    }

    fn get_tier(vars: &SharedVariables, name: &str) -> Dynamic {
        read(vars)
            .get(name)
            .map(json_to_dynamic)
            .unwrap_or(Dynamic::UNIT)
    }

    fn set_tier(vars: &SharedVariables, name: &str, value: &Dynamic) {
        write(vars).insert(name.to_string(), to_json(value));
    }

    fn get_env(&mut self, name: &str) -> Dynamic {
        env_var(&self.env, name)
            .map(Dynamic::from)
            .unwrap_or(Dynamic::UNIT)
    }

    fn set_env(&mut self, name: &str, value: Dynamic) {
        let text = match to_json(&value) {
            Value::String(s) => s,
            other => other.to_string(),
        };
        write(&self.env).insert(name.to_string(), Value::String(text));
    }

    fn sleep(&mut self, ms: INT) -> Result<(), Box<EvalAltResult>> {
        const SLICE: Duration = Duration::from_millis(10);
        let until = Instant::now() + Duration::from_millis(ms.max(0) as u64);
        loop {
            if let Some(reason) = self.control.interruption() {
                return Err(reason.into_error());
            }
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            std::thread::sleep((until - now).min(SLICE));
        }
    }

    fn ensure_process_allowed(&self) -> Result<(), Box<EvalAltResult>> {
        if self.allow_process {
            Ok(())
        } else {
            Err(runtime_error("当前沙箱不允许启动外部进程"))
        }
    }

    fn exec(&mut self, command: &str) -> Result<rhai::Map, Box<EvalAltResult>> {
        self.ensure_process_allowed()?;
        let output = shell(command)
            .output()
            .map_err(|e| runtime_error(format!("执行命令失败: {}", e)))?;

        let mut result = rhai::Map::new();
        result.insert(
            "code".into(),
            Dynamic::from(output.status.code().unwrap_or(-1) as INT),
        );
        result.insert(
            "stdout".into(),
            Dynamic::from(String::from_utf8_lossy(&output.stdout).into_owned()),
        );
        result.insert(
            "stderr".into(),
            Dynamic::from(String::from_utf8_lossy(&output.stderr).into_owned()),
        );
        Ok(result)
    }

    fn spawn(&mut self, command: &str) -> Result<INT, Box<EvalAltResult>> {
        self.ensure_process_allowed()?;
        let child = shell(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| runtime_error(format!("启动进程失败: {}", e)))?;
        Ok(child.id() as INT)
    }
}

fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

pub(crate) fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE).into()
}

pub(crate) fn register(engine: &mut Engine) {
    engine
        .register_type_with_name::<ScriptContext>("Context")
        .register_fn("get", ScriptContext::get)
        .register_fn("set", ScriptContext::set)
        .register_fn("remove", ScriptContext::remove)
        .register_fn("get_local", |ctx: &mut ScriptContext, name: &str| {
            ScriptContext::get_tier(&ctx.local, name)
        })
        .register_fn("set_local", |ctx: &mut ScriptContext, name: &str, value: Dynamic| {
            ScriptContext::set_tier(&ctx.local, name, &value)
        })
        .register_fn("get_global", |ctx: &mut ScriptContext, name: &str| {
            ScriptContext::get_tier(&ctx.global, name)
        })
        .register_fn("set_global", |ctx: &mut ScriptContext, name: &str, value: Dynamic| {
            ScriptContext::set_tier(&ctx.global, name, &value)
        })
        .register_fn("get_env", ScriptContext::get_env)
        .register_fn("set_env", ScriptContext::set_env)
        .register_fn("sleep", ScriptContext::sleep)
        .register_fn("exec", ScriptContext::exec)
        .register_fn("spawn", ScriptContext::spawn);
}
