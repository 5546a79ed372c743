//! CLI 命令处理模块

pub mod call;
pub mod output; // 结果文件与终端输出
pub mod run;
