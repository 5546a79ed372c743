//! 模块白名单
//!
//! 脚本只能导入内置的工具模块和执行环境中声明的共享脚本。

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rhai::module_resolvers::ModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Module, Position, Scope, Shared, INT};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::runtime_error;
use crate::decycle::{json_to_dynamic, to_json};

/// 内置模块名称
pub const BUILTIN_MODULES: [&str; 4] = ["json", "base64", "time", "uuid"];

/// 白名单模块解析器
pub struct AllowListResolver {
    snippets: Arc<HashMap<String, String>>,
}

impl AllowListResolver {
    pub fn new(snippets: Arc<HashMap<String, String>>) -> Self {
        Self { snippets }
    }
}

impl ModuleResolver for AllowListResolver {
    fn resolve(
        &self,
        engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        let module = match path {
            "json" => json_module(),
            "base64" => base64_module(),
            "time" => time_module(),
            "uuid" => uuid_module(),
            name => {
                let source = self
                    .snippets
                    .get(name)
                    .ok_or_else(|| Box::new(EvalAltResult::ErrorModuleNotFound(name.to_string(), pos)))?;
                let ast = engine.compile(source).map_err(|e| {
                    Box::new(EvalAltResult::ErrorInModule(name.to_string(), e.into(), pos))
                })?;
                Module::eval_ast_as_new(Scope::new(), &ast, engine).map_err(|e| {
                    Box::new(EvalAltResult::ErrorInModule(name.to_string(), e, pos))
                })?
            }
        };
        Ok(module.into())
    }
}

fn json_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("parse", |text: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| runtime_error(format!("JSON 解析失败: {}", e)))?;
        Ok(json_to_dynamic(&value))
    });
    module.set_native_fn("stringify", |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
        Ok(to_json(&value).to_string())
    });
    module
}

fn base64_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("encode", |text: &str| -> Result<String, Box<EvalAltResult>> {
        Ok(STANDARD.encode(text.as_bytes()))
    });
    module.set_native_fn("decode", |text: &str| -> Result<String, Box<EvalAltResult>> {
        let bytes = STANDARD
            .decode(text)
            .map_err(|e| runtime_error(format!("Base64 解码失败: {}", e)))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    });
    module
}

fn time_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("now", || -> Result<INT, Box<EvalAltResult>> {
        Ok(chrono::Utc::now().timestamp_millis())
    });
    module.set_native_fn("iso", || -> Result<String, Box<EvalAltResult>> {
        Ok(chrono::Utc::now().to_rfc3339())
    });
    module
}

fn uuid_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("v4", || -> Result<String, Box<EvalAltResult>> {
        Ok(uuid::Uuid::new_v4().to_string())
    });
    module
}
