//! 变量作用域
//!
//! 三层变量按 上下文 > 用例局部 > 全局 的顺序解析。上下文层是写时复制的，
//! 分支和迭代各自拿到一份副本，兄弟分支之间互不可见；
//! 用例局部层、全局层和环境变量覆盖层在整个执行内共享。

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};
use steprun_common::VariableTier;
use steprun_sandbox::context::{env_var, read, write};
use steprun_sandbox::{ScriptBindings, SharedVariables};

static TEMPLATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_$][\w$.\[\]-]*)\s*\}\}").unwrap_or_else(|_| unreachable!())
});

/// 变量作用域
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    context: Arc<Map<String, Value>>,
    local: SharedVariables,
    global: SharedVariables,
    env: SharedVariables,
}

impl VariableScope {
    /// 以用例变量和全局变量初值创建
    pub fn new(local: Map<String, Value>, global: Map<String, Value>) -> Self {
        Self {
            context: Arc::new(Map::new()),
            local: Arc::new(RwLock::new(local)),
            global: Arc::new(RwLock::new(global)),
            env: Arc::new(RwLock::new(Map::new())),
        }
    }

    /// 为子分支复制一份作用域
    ///
    /// 上下文层在首次写入时才真正复制。
    pub fn branch(&self) -> Self {
        self.clone()
    }

    /// 按优先级解析变量
    pub fn get(&self, name: &str) -> Option<Value> {
        self.context
            .get(name)
            .cloned()
            .or_else(|| read(&self.local).get(name).cloned())
            .or_else(|| read(&self.global).get(name).cloned())
    }

    /// 读取指定层的变量
    pub fn get_in(&self, tier: VariableTier, name: &str) -> Option<Value> {
        match tier {
            VariableTier::Context => self.context.get(name).cloned(),
            VariableTier::Local => read(&self.local).get(name).cloned(),
            VariableTier::Global => read(&self.global).get(name).cloned(),
        }
    }

    /// 写入上下文层
    pub fn set(&mut self, name: &str, value: Value) {
        Arc::make_mut(&mut self.context).insert(name.to_string(), value);
    }

    /// 写入指定层
    pub fn set_in(&mut self, tier: VariableTier, name: &str, value: Value) {
        match tier {
            VariableTier::Context => self.set(name, value),
            VariableTier::Local => {
                write(&self.local).insert(name.to_string(), value);
            }
            VariableTier::Global => {
                write(&self.global).insert(name.to_string(), value);
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        Arc::make_mut(&mut self.context).remove(name)
    }

    /// 上下文层变量
    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    /// 环境变量 (覆盖层优先)
    pub fn env_var(&self, name: &str) -> Option<String> {
        env_var(&self.env, name)
    }

    /// 脚本可见的变量
    pub fn to_bindings(&self) -> ScriptBindings {
        ScriptBindings {
            context: (*self.context).clone(),
            local: Arc::clone(&self.local),
            global: Arc::clone(&self.global),
            env: Arc::clone(&self.env),
        }
    }

    /// 用脚本结束后的上下文层替换当前上下文层
    pub fn apply_context(&mut self, context: Map<String, Value>) {
        if *self.context != context {
            self.context = Arc::new(context);
        }
    }

    /// 解析带路径的变量引用，例如 `user.name` 或 `items[0]`
    pub fn resolve(&self, reference: &str) -> Option<Value> {
        if let Some(value) = self.get(reference) {
            return Some(value);
        }
        let split = reference.find(|c| c == '.' || c == '[')?;
        let (name, rest) = reference.split_at(split);
        let root = self.get(name)?;
        lookup_path(&root, rest.trim_start_matches('.')).cloned()
    }

    /// 渲染字符串模板中的 `{{name}}`
    ///
    /// 找不到的变量保持原样。
    pub fn render(&self, template: &str) -> String {
        TEMPLATE
            .replace_all(template, |caps: &Captures| {
                let name = &caps[1];
                match self.resolve(name) {
                    Some(Value::String(s)) => s,
                    Some(value) => value.to_string(),
                    None => self
                        .env_var(name)
                        .unwrap_or_else(|| caps[0].to_string()),
                }
            })
            .into_owned()
    }

    /// 递归渲染 JSON 值中的字符串
    ///
    /// 整个字符串恰好是一个 `{{name}}` 时保留变量原本的类型。
    pub fn render_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                if let Some(caps) = TEMPLATE.captures(s) {
                    if caps[0].len() == s.len() {
                        if let Some(resolved) = self.resolve(&caps[1]) {
                            return resolved;
                        }
                    }
                }
                Value::String(self.render(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// 按路径取值
///
/// 以 `/` 开头时按 JSON Pointer 解析，否则按 `a.b[0].c` 形式的点分路径解析；
/// 空路径返回值本身。
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() || path == "$" {
        return Some(value);
    }
    if path.starts_with('/') {
        return value.pointer(path);
    }

    let path = path.strip_prefix("$.").unwrap_or(path);
    let mut current = value;
    for segment in path.split('.') {
        let (key, indices) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };

        if !key.is_empty() {
            current = match current {
                Value::Object(map) => map.get(key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        for index in indices
            .split(|c| c == '[' || c == ']')
            .filter(|s| !s.is_empty())
        {
            current = current.get(index.parse::<usize>().ok()?)?;
        }
    }
    Some(current)
}
