//! 调度器与工作线程之间的消息协议
//!
//! 所有消息都带有 `requestId` 或 `executeId` 关联字段。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ExecuteEnv, ExecuteSpec, ExecuteStatus, LogEntry, StepError, StepState, StepStatus};

/// 调度器下发给工作线程的任务
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerTask {
    /// 开始执行
    #[serde(rename_all = "camelCase")]
    Execute {
        request_id: String,
        env: ExecuteEnv,
        spec: ExecuteSpec,
        #[serde(default)]
        retry: u32,
    },

    /// 查询结果树或单个步骤详情
    #[serde(rename_all = "camelCase")]
    Query {
        request_id: String,
        execute_id: String,
        target: QueryTarget,
    },

    /// 协作式取消
    #[serde(rename_all = "camelCase")]
    Cancel {
        request_id: String,
        execute_id: String,
    },

    /// 无需执行树的工具调用
    #[serde(rename_all = "camelCase")]
    Call { request_id: String, call: CallRequest },

    /// 向等待交互的步骤提交用户输入
    #[serde(rename_all = "camelCase")]
    Interact {
        request_id: String,
        execute_id: String,
        /// 节点路径或步骤 ID
        node: String,
        answer: Value,
    },
}

impl WorkerTask {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Execute { request_id, .. }
            | Self::Query { request_id, .. }
            | Self::Cancel { request_id, .. }
            | Self::Call { request_id, .. }
            | Self::Interact { request_id, .. } => request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execute { .. } => "EXECUTE",
            Self::Query { .. } => "QUERY",
            Self::Cancel { .. } => "CANCEL",
            Self::Call { .. } => "CALL",
            Self::Interact { .. } => "INTERACT",
        }
    }
}

/// 查询目标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "camelCase")]
pub enum QueryTarget {
    /// 整棵结果树
    Tree,
    /// 单个步骤详情 (节点路径或步骤 ID)
    Detail { node: String },
}

/// 工具调用
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum CallRequest {
    /// 测试数据源连通性
    #[serde(rename_all = "camelCase")]
    TestConnection {
        #[serde(rename = "type")]
        source_type: String,
        config: Value,
    },

    /// 在数据源上执行一条命令
    #[serde(rename_all = "camelCase")]
    DataSourceExecute {
        #[serde(rename = "type")]
        source_type: String,
        config: Value,
        command: String,
    },
}

/// 工作线程上报的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum WorkerEvent {
    /// 执行状态变化
    #[serde(rename_all = "camelCase")]
    Status {
        execute_id: String,
        status: ExecuteStatus,
        #[serde(default)]
        retry: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// 步骤进度
    #[serde(rename_all = "camelCase")]
    Progress {
        execute_id: String,
        key: String,
        id: String,
        status: StepStatus,
        state: StepState,
        #[serde(default)]
        total_time: u64,
        /// 进入交互状态时附带的提示
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<Value>,
    },

    /// 脚本日志
    #[serde(rename_all = "camelCase")]
    Log {
        execute_id: String,
        key: String,
        entry: LogEntry,
    },

    /// 执行完成，负载为压缩后的结果
    #[serde(rename_all = "camelCase")]
    Done {
        execute_id: String,
        #[serde(with = "crate::codec::base64_bytes")]
        payload: Vec<u8>,
    },

    /// 工作线程异常退出
    #[serde(rename_all = "camelCase")]
    Exit {
        execute_id: String,
        reason: String,
    },

    /// 错误 (请求失败或执行级错误)
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execute_id: Option<String>,
        error: StepError,
    },

    /// QUERY / CALL / INTERACT / CANCEL 的应答
    #[serde(rename_all = "camelCase")]
    Reply { request_id: String, data: Value },

    /// 心跳
    #[serde(rename_all = "camelCase")]
    Heartbeat { worker: usize, time: i64 },
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Progress { .. } => "progress",
            Self::Log { .. } => "log",
            Self::Done { .. } => "done",
            Self::Exit { .. } => "exit",
            Self::Error { .. } => "error",
            Self::Reply { .. } => "reply",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    /// 应答类事件的请求 ID
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Reply { request_id, .. } => Some(request_id),
            Self::Error {
                request_id: Some(request_id),
                ..
            } => Some(request_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_wire_format() {
        let task = WorkerTask::Query {
            request_id: "r1".to_string(),
            execute_id: "e1".to_string(),
            target: QueryTarget::Detail {
                node: "0/0.1".to_string(),
            },
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["kind"], "QUERY");
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["target"]["target"], "detail");
        assert_eq!(value["target"]["node"], "0/0.1");

        let parsed: WorkerTask = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.request_id(), "r1");
        assert_eq!(parsed.kind(), "QUERY");
    }

    #[test]
    fn test_done_payload_is_base64() {
        let event = WorkerEvent::Done {
            execute_id: "e1".to_string(),
            payload: vec![1, 2, 3],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "done");
        assert_eq!(value["payload"], json!("AQID"));

        let parsed: WorkerEvent = serde_json::from_value(value).unwrap();
        assert!(matches!(parsed, WorkerEvent::Done { payload, .. } if payload == vec![1, 2, 3]));
    }

    #[test]
    fn test_call_request_tag() {
        let call: CallRequest = serde_json::from_value(json!({
            "op": "testConnection",
            "type": "mock",
            "config": {"host": "localhost"}
        }))
        .unwrap();
        assert!(matches!(call, CallRequest::TestConnection { ref source_type, .. } if source_type == "mock"));
    }
}
