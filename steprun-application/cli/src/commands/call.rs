//! Call 命令处理

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;
use steprun_common::CallRequest;
use steprun_dispatch::{Dispatcher, EngineConfig};

pub async fn handle(args: crate::CallArgs, config: EngineConfig) -> Result<()> {
    let call = build_request(&args)?;
    let output = Dispatcher::new(config).call(call).await?;

    println!("{} {}", "✓".green().bold(), args.source_type.cyan());
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn build_request(args: &crate::CallArgs) -> Result<CallRequest> {
    let config: Value = serde_json::from_str(&args.config).context("--config 不是合法的 JSON")?;
    let source_type = args.source_type.clone();

    Ok(match &args.command {
        Some(command) => CallRequest::DataSourceExecute {
            source_type,
            config,
            command: command.clone(),
        },
        None => CallRequest::TestConnection {
            source_type,
            config,
        },
    })
}
