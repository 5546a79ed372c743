//! 控制台输出捕获

use rhai::{Dynamic, Engine};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use steprun_common::{LogEntry, LogLevel};

use crate::decycle::to_json;

/// 实时日志回调
pub type LogSink = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// 脚本中的 `console` 对象
#[derive(Clone)]
pub struct Console {
    entries: Arc<Mutex<Vec<LogEntry>>>,
    live: Option<LogSink>,
}

impl Console {
    pub fn new(live: Option<LogSink>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            live,
        }
    }

    /// 记录一组脚本值
    pub fn write(&self, level: LogLevel, values: &[Dynamic]) {
        self.push(LogEntry::new(level, values.iter().map(to_json).collect()));
    }

    /// 记录一行文本 (print / debug 语句)
    pub fn write_text(&self, level: LogLevel, text: &str) {
        self.push(LogEntry::new(level, vec![Value::String(text.to_string())]));
    }

    fn push(&self, entry: LogEntry) {
        if let Some(live) = &self.live {
            live(&entry);
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// 取出已捕获的日志
    pub fn take(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.entries.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// 单个方法允许的最多参数个数
pub const MAX_CONSOLE_ARGS: usize = 8;

/// 为一个方法名按参数个数逐一注册重载
macro_rules! register_arities {
    ($engine:expr, $name:expr, $level:expr, $( ($($arg:ident),+) ),+ $(,)?) => {
        $(
            $engine.register_fn($name, move |console: &mut Console, $($arg: Dynamic),+| {
                console.write($level, &[$($arg),+]);
            });
        )+
    };
}

/// 注册 `console.log/info/warn/error/trace`，每个方法接受 1 到 [`MAX_CONSOLE_ARGS`] 个参数
///
/// `debug` 是 rhai 保留字，调试级别的输出用 `console.trace` 或 `debug(...)` 语句。
pub(crate) fn register(engine: &mut Engine) {
    engine.register_type_with_name::<Console>("Console");

    for (name, level) in [
        ("log", LogLevel::Info),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
        ("trace", LogLevel::Debug),
    ] {
        register_arities!(
            engine,
            name,
            level,
            (a),
            (a, b),
            (a, b, c),
            (a, b, c, d),
            (a, b, c, d, e),
            (a, b, c, d, e, f),
            (a, b, c, d, e, f, g),
            (a, b, c, d, e, f, g, h),
        );
    }
}
