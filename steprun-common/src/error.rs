//! 错误分类
//!
//! 每个步骤错误都带有错误码和严重级别。严重级别是全序的，
//! 组合步骤总是以子步骤中最严重的级别上报。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// 通用错误
    General,
    /// 前置脚本错误
    Pre,
    /// 后置脚本错误
    Post,
    /// 执行错误
    Execute,
    /// 后端明确拒绝 (例如 HTTP 4xx)
    Response,
    /// 变量提取失败
    Assignment,
    /// 断言失败
    Assert,
    /// 引擎/配置级错误
    System,
    /// 子步骤失败
    Combination,
    /// 用户交互失败或被拒绝
    Interact,
    /// 未知错误
    Unknown,
}

impl ErrorKind {
    /// 所有错误类别
    pub const ALL: [ErrorKind; 11] = [
        ErrorKind::General,
        ErrorKind::Pre,
        ErrorKind::Post,
        ErrorKind::Execute,
        ErrorKind::Response,
        ErrorKind::Assignment,
        ErrorKind::Assert,
        ErrorKind::System,
        ErrorKind::Combination,
        ErrorKind::Interact,
        ErrorKind::Unknown,
    ];

    /// 错误码
    pub fn code(&self) -> u16 {
        match self {
            Self::General => 1,
            Self::Pre => 2,
            Self::Post => 3,
            Self::Execute => 4,
            Self::Response => 5,
            Self::Assignment => 6,
            Self::Assert => 7,
            Self::System => 8,
            Self::Combination => 9,
            Self::Interact => 10,
            Self::Unknown => 255,
        }
    }

    /// 从错误码还原类别，无法识别的错误码归为 Unknown
    pub fn from_code(code: u16) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.code() == code)
            .unwrap_or(Self::Unknown)
    }

    /// 默认严重级别
    ///
    /// Combination 的实际级别取决于被包装的子错误，这里只给出下限。
    pub fn severity(&self) -> u8 {
        match self {
            Self::General
            | Self::Pre
            | Self::Post
            | Self::Response
            | Self::Assert
            | Self::Interact
            | Self::Combination => 1,
            Self::Execute | Self::Assignment => 2,
            Self::System => 3,
            Self::Unknown => 255,
        }
    }

    /// 名称 (与序列化格式一致)
    pub fn name(&self) -> &'static str {
        match self {
            Self::General => "GENERAL",
            Self::Pre => "PRE",
            Self::Post => "POST",
            Self::Execute => "EXECUTE",
            Self::Response => "RESPONSE",
            Self::Assignment => "ASSIGNMENT",
            Self::Assert => "ASSERT",
            Self::System => "SYSTEM",
            Self::Combination => "COMBINATION",
            Self::Interact => "INTERACT",
            Self::Unknown => "UNKNOWN",
        }
    }

    fn bit(&self) -> u32 {
        let position = Self::ALL
            .iter()
            .position(|kind| kind == self)
            .unwrap_or(Self::ALL.len() - 1);
        1 << position
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 错误类别集合
///
/// 用于 Poll 的 `breakError` 等需要组合多个类别的配置。
/// 序列化为类别名称列表，反序列化同时接受名称列表和原始位掩码。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorKindSet(u32);

impl ErrorKindSet {
    pub const EMPTY: Self = Self(0);

    /// 创建空集合
    pub const fn empty() -> Self {
        Self::EMPTY
    }

    /// 包含所有类别的集合
    pub fn all() -> Self {
        ErrorKind::ALL.iter().copied().collect()
    }

    /// 严重级别不低于 `severity` 的所有类别 (不含 Combination)
    pub fn at_least(severity: u8) -> Self {
        ErrorKind::ALL
            .iter()
            .copied()
            .filter(|kind| *kind != ErrorKind::Combination && kind.severity() >= severity)
            .collect()
    }

    /// 是否包含指定类别
    pub fn contains(&self, kind: ErrorKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// 加入类别
    pub fn insert(&mut self, kind: ErrorKind) {
        self.0 |= kind.bit();
    }

    /// 加入类别 (构建器风格)
    pub fn with(mut self, kind: ErrorKind) -> Self {
        self.insert(kind);
        self
    }

    /// 并集
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// 原始位掩码
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// 遍历集合中的类别
    pub fn iter(&self) -> impl Iterator<Item = ErrorKind> + '_ {
        ErrorKind::ALL
            .iter()
            .copied()
            .filter(move |kind| self.contains(*kind))
    }
}

impl FromIterator<ErrorKind> for ErrorKindSet {
    fn from_iter<I: IntoIterator<Item = ErrorKind>>(iter: I) -> Self {
        let mut set = Self::empty();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

impl Serialize for ErrorKindSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for ErrorKindSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bits(u32),
            Kinds(Vec<ErrorKind>),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Bits(bits) => Self(bits),
            Repr::Kinds(kinds) => kinds.into_iter().collect(),
        })
    }
}

/// 步骤错误
///
/// 线上格式为 `{message, stack?, code, ...}`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct StepError {
    /// 错误类别
    pub kind: ErrorKind,

    /// 错误码
    pub code: u16,

    /// 严重级别
    pub severity: u8,

    /// 错误信息
    pub message: String,

    /// 调用栈 (仅脚本错误)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// 附加数据 (组合错误为失败子步骤的序号列表)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl StepError {
    /// 创建指定类别的错误
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code(),
            severity: kind.severity(),
            message: message.into(),
            stack: None,
            extra: None,
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::General, message)
    }

    pub fn pre(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Pre, message)
    }

    pub fn post(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Post, message)
    }

    pub fn execute(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execute, message)
    }

    pub fn response(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Response, message)
    }

    pub fn assignment(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Assignment, message)
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Assert, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    pub fn interact(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Interact, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// 超时错误
    pub fn timeout(kind: ErrorKind, timeout_ms: u64) -> Self {
        Self::new(kind, format!("执行超时 ({}ms)", timeout_ms))
            .with_extra(json!({ "timeout": timeout_ms }))
    }

    /// 组合错误
    ///
    /// `indices` 为失败子步骤的 1 起始序号，严重级别取子错误中的最大值。
    pub fn combination(indices: Vec<usize>, causes: &[StepError]) -> Self {
        let listed = indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let mut error = Self::new(
            ErrorKind::Combination,
            format!("第 {} 个子步骤执行失败", listed),
        );
        error.severity = max_severity(causes).max(ErrorKind::Combination.severity());
        error.extra = Some(json!(indices));
        error
    }

    /// 将任意错误包装为执行错误
    pub fn wrap_execute(error: impl fmt::Display) -> Self {
        Self::execute(error.to_string())
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }

    /// 改变错误类别，严重级别随之重算
    pub fn reclassify(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self.code = kind.code();
        self.severity = kind.severity();
        self
    }

    /// 组合错误中的失败子步骤序号
    pub fn combination_indices(&self) -> Vec<usize> {
        if self.kind != ErrorKind::Combination {
            return Vec::new();
        }
        self.extra
            .as_ref()
            .and_then(|extra| serde_json::from_value(extra.clone()).ok())
            .unwrap_or_default()
    }

    /// 是否为超时错误
    pub fn is_timeout(&self) -> bool {
        self.extra
            .as_ref()
            .and_then(|extra| extra.get("timeout"))
            .is_some()
    }
}

/// 一组错误中的最高严重级别 (空列表为 0)
pub fn max_severity(errors: &[StepError]) -> u8 {
    errors.iter().map(|e| e.severity).max().unwrap_or(0)
}
