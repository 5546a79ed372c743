//! 步骤状态、生命周期阶段与步骤标志

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// 等待执行
    #[default]
    Wait,
    /// 执行中
    Running,
    /// 执行完成
    Done,
    /// 已跳过
    Skip,
    /// 等待用户交互
    Interact,
    /// 执行失败
    Error,
}

impl StepStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Skip | Self::Error)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Wait => "WAIT",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Skip => "SKIP",
            Self::Interact => "INTERACT",
            Self::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}

/// 单步骤生命周期阶段
///
/// 严格按 INIT→PRE→EXECUTE→POST→ASSIGNMENT→ASSERT→DONE 推进。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    #[default]
    Init,
    Pre,
    Execute,
    Post,
    Assignment,
    Assert,
    Done,
}

impl StepState {
    /// 下一个阶段，DONE 之后保持不变
    pub fn next(&self) -> Self {
        match self {
            Self::Init => Self::Pre,
            Self::Pre => Self::Execute,
            Self::Execute => Self::Post,
            Self::Post => Self::Assignment,
            Self::Assignment => Self::Assert,
            Self::Assert | Self::Done => Self::Done,
        }
    }
}

/// 单次执行 (一个用例) 的整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecuteStatus {
    #[default]
    Wait,
    Running,
    Done,
    Error,
    Timeout,
    Cancelled,
    /// 工作线程异常退出
    Exit,
}

impl ExecuteStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Wait | Self::Running)
    }
}

impl fmt::Display for ExecuteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Wait => "WAIT",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Exit => "EXIT",
        };
        write!(f, "{}", name)
    }
}

/// 步骤标志集合
///
/// 输入中既可以是整数位掩码，也可以是名称列表。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StepFlags(u8);

impl StepFlags {
    pub const NONE: Self = Self(0);
    /// 禁用 (跳过执行)
    pub const DISABLED: Self = Self(1);
    /// 接口步骤
    pub const INTERFACE: Self = Self(1 << 1);
    /// 使用 Mock
    pub const MOCK: Self = Self(1 << 2);

    const NAMED: [(&'static str, StepFlags); 3] = [
        ("disabled", Self::DISABLED),
        ("interface", Self::INTERFACE),
        ("mock", Self::MOCK),
    ];

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_disabled(&self) -> bool {
        self.contains(Self::DISABLED)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl Serialize for StepFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.0)
    }
}

impl<'de> Deserialize<'de> for StepFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bits(u8),
            Names(Vec<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bits(bits) => Ok(Self(bits)),
            Repr::Names(names) => {
                let mut flags = Self::NONE;
                for name in names {
                    let flag = Self::NAMED
                        .iter()
                        .find(|(n, _)| n.eq_ignore_ascii_case(&name))
                        .map(|(_, f)| *f)
                        .ok_or_else(|| {
                            serde::de::Error::custom(format!("未知的步骤标志: {}", name))
                        })?;
                    flags.insert(flag);
                }
                Ok(flags)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order() {
        let mut state = StepState::Init;
        let mut visited = vec![state];
        while state != StepState::Done {
            state = state.next();
            visited.push(state);
        }
        assert_eq!(
            visited,
            vec![
                StepState::Init,
                StepState::Pre,
                StepState::Execute,
                StepState::Post,
                StepState::Assignment,
                StepState::Assert,
                StepState::Done,
            ]
        );
        assert_eq!(StepState::Done.next(), StepState::Done);
    }

    #[test]
    fn test_flags_from_bits_and_names() {
        let flags: StepFlags = serde_json::from_str("5").unwrap();
        assert!(flags.is_disabled());
        assert!(flags.contains(StepFlags::MOCK));
        assert!(!flags.contains(StepFlags::INTERFACE));

        let flags: StepFlags = serde_json::from_str(r#"["interface"]"#).unwrap();
        assert!(flags.contains(StepFlags::INTERFACE));
        assert!(!flags.is_disabled());

        assert!(serde_json::from_str::<StepFlags>(r#"["bogus"]"#).is_err());
    }

    #[test]
    fn test_terminal_status() {
        assert!(StepStatus::Done.is_terminal());
        assert!(StepStatus::Skip.is_terminal());
        assert!(!StepStatus::Interact.is_terminal());
        assert!(ExecuteStatus::Exit.is_terminal());
        assert!(!ExecuteStatus::Running.is_terminal());
    }
}
