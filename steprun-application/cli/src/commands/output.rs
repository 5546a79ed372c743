//! 结果输出
//!
//! 每个执行写一个 `<executeId>.json`，批次结束后写 `summary.json`。

use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use steprun_common::ExecuteStatus;
use steprun_dispatch::{BatchSummary, ExecutionReport};

/// 执行 id 中不适合出现在文件名里的字符替换为 `_`
pub fn result_file(dir: &Path, execute_id: &str) -> PathBuf {
    let name: String = execute_id
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    dir.join(format!("{}.json", name))
}

/// 写入单个执行的结果文件
///
/// 没有完整结果 (工作线程异常退出、排队中被取消) 时写入状态和原因。
pub fn write_report(dir: &Path, report: &ExecutionReport) -> Result<PathBuf> {
    let content = match &report.result {
        Some(result) => serde_json::to_string_pretty(result)?,
        None => serde_json::to_string_pretty(&json!({
            "executeId": report.execute_id,
            "status": report.status,
            "retry": report.retry,
            "reason": report.reason,
        }))?,
    };

    let path = result_file(dir, &report.execute_id);
    fs::write(&path, content).with_context(|| format!("写入结果文件失败: {:?}", path))?;
    Ok(path)
}

pub fn write_summary(dir: &Path, summary: &BatchSummary) -> Result<PathBuf> {
    let path = dir.join("summary.json");
    fs::write(&path, serde_json::to_string_pretty(summary)?)
        .with_context(|| format!("写入汇总文件失败: {:?}", path))?;
    Ok(path)
}

pub fn colored_status(status: ExecuteStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        ExecuteStatus::Done => text.green(),
        ExecuteStatus::Error => text.red(),
        ExecuteStatus::Timeout | ExecuteStatus::Exit => text.yellow(),
        _ => text.bright_black(),
    }
}

pub fn print_summary(summary: &BatchSummary) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "批次汇总".bold());
    println!("{}", "=".repeat(60));
    println!();

    for entry in &summary.executions {
        let mut line = format!(
            "  {:<24} {:<10} {:>8} ms",
            entry.execute_id,
            colored_status(entry.status),
            entry.total_time
        );
        if entry.retry > 0 {
            line.push_str(&format!("  重试 {}", entry.retry));
        }
        if let Some(reason) = &entry.reason {
            line.push_str(&format!("  {}", reason.bright_black()));
        }
        println!("{}", line);
    }

    println!();
    println!("  总数: {}", summary.total.to_string().bright_blue());
    for (status, count) in &summary.counts {
        println!("  {}: {}", status, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steprun_common::ExecutionResult;

    fn report(execute_id: &str, result: Option<ExecutionResult>) -> ExecutionReport {
        ExecutionReport {
            execute_id: execute_id.to_string(),
            status: ExecuteStatus::Exit,
            retry: 1,
            reason: Some("工作线程退出".to_string()),
            result,
        }
    }

    #[test]
    fn test_result_file_name() {
        let dir = Path::new("/tmp/out");
        assert_eq!(result_file(dir, "case-1"), dir.join("case-1.json"));
        assert_eq!(result_file(dir, "a/b c"), dir.join("a_b_c.json"));
    }

    #[test]
    fn test_write_report_without_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_report(dir.path(), &report("e1", None)).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["executeId"], "e1");
        assert_eq!(written["status"], "EXIT");
        assert_eq!(written["reason"], "工作线程退出");
    }

    #[test]
    fn test_write_report_with_result() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = ExecutionResult::new("e2");
        result.status = ExecuteStatus::Done;
        let path = write_report(dir.path(), &report("e2", Some(result.clone()))).unwrap();

        let written: ExecutionResult =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written, result);
    }

    #[test]
    fn test_write_summary() {
        let dir = tempfile::tempdir().unwrap();
        let summary = BatchSummary::new(vec![report("e1", None).entry()]);
        let path = write_summary(dir.path(), &summary).unwrap();
        assert!(path.ends_with("summary.json"));

        let written: BatchSummary = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written.total, 1);
        assert_eq!(written.counts.get("EXIT"), Some(&1));
    }
}
