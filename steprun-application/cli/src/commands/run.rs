//! Run 命令处理

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::Read;
use std::path::Path;
use steprun_common::Batch;
use steprun_dispatch::{DispatchHandle, Dispatcher, EngineConfig};
use tokio::signal;
use tracing::{info, warn};

use super::output;

pub async fn handle(args: crate::RunArgs, mut config: EngineConfig) -> Result<()> {
    let batch = read_batch(args.input.as_deref())?;
    if let Err(problems) = batch.validate() {
        for problem in &problems {
            eprintln!("{} {}", "✗".red().bold(), problem);
        }
        anyhow::bail!("批次校验失败: {} 个问题", problems.len());
    }

    apply_overrides(&mut config, &args);
    fs::create_dir_all(&args.output)
        .with_context(|| format!("创建输出目录失败: {:?}", args.output))?;

    let total = batch.executions.len();
    let mut run = Dispatcher::new(config).run_batch(batch)?;
    tokio::spawn(forward_interrupts(run.handle.clone()));

    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );

    while let Some(report) = run.reports.recv().await {
        let path = output::write_report(&args.output, &report)?;
        progress.println(format!(
            "{} {} -> {}",
            output::colored_status(report.status),
            report.execute_id.cyan(),
            path.display()
        ));
        progress.inc(1);
    }
    progress.finish_with_message("完成".green().to_string());

    let summary = run.wait().await?;
    let path = output::write_summary(&args.output, &summary)?;
    output::print_summary(&summary);
    info!("汇总已写入 {:?}", path);
    Ok(())
}

/// 读取批次，`None` 或 `-` 表示标准输入
fn read_batch(input: Option<&Path>) -> Result<Batch> {
    let content = match input {
        Some(path) if path != Path::new("-") => {
            fs::read_to_string(path).with_context(|| format!("读取批次文件失败: {:?}", path))?
        }
        _ => {
            let mut content = String::new();
            std::io::stdin()
                .read_to_string(&mut content)
                .context("读取标准输入失败")?;
            content
        }
    };
    serde_json::from_str(&content).context("解析批次 JSON 失败")
}

/// 命令行参数覆盖配置 (优先级高于环境变量和配置文件)
fn apply_overrides(config: &mut EngineConfig, args: &crate::RunArgs) {
    if let Some(workers) = args.workers {
        config.dispatch.workers = Some(workers);
    }
    if let Some(timeout) = args.timeout {
        config.dispatch.timeout = timeout;
    }
    if let Some(retry) = args.retry {
        config.dispatch.retry = retry;
    }
}

/// 第一次 Ctrl-C 取消全部执行，第二次立即结束
async fn forward_interrupts(handle: DispatchHandle) {
    if signal::ctrl_c().await.is_err() {
        return;
    }
    warn!("收到中断信号，取消全部执行");
    handle.cancel_all();

    if signal::ctrl_c().await.is_ok() {
        warn!("再次收到中断信号，立即结束");
        handle.shutdown();
    }
}
