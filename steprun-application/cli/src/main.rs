//! StepRun CLI 应用

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use steprun_dispatch::EngineConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "steprun")]
#[command(about = "StepRun - 步骤编排执行引擎", long_about = None)]
#[command(version)]
struct Cli {
    /// 日志级别，也可以是完整的过滤表达式 (默认取配置文件或 STEPRUN_LOG_LEVEL)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 执行一个批次
    Run(RunArgs),

    /// 数据源连通性测试或直接执行命令
    Call(CallArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// 批次文件 (JSON)，`-` 或不指定时从标准输入读取
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// 结果输出目录
    #[arg(short, long)]
    output: PathBuf,

    /// 工作线程数
    #[arg(short, long)]
    workers: Option<usize>,

    /// 单次执行超时 (秒)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// 工作线程异常退出后的重试次数
    #[arg(short, long)]
    retry: Option<u32>,

    /// 配置文件路径 (TOML/YAML/JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
pub struct CallArgs {
    /// 数据源类型
    #[arg(long = "type")]
    source_type: String,

    /// 数据源配置 (JSON)
    #[arg(long, default_value = "{}")]
    config: String,

    /// 要执行的命令，不指定时只做连通性测试
    #[arg(long)]
    command: Option<String>,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_file = match &cli.command {
        Commands::Run(args) => args.config.as_deref(),
        Commands::Call(_) => None,
    };
    let config = match config_file {
        Some(path) => EngineConfig::load_with_file(path)?,
        None => EngineConfig::load()?,
    };

    // 初始化日志
    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    init_logging(level);

    info!("StepRun CLI 启动");

    // 处理命令
    match cli.command {
        Commands::Run(args) => commands::run::handle(args, config).await?,
        Commands::Call(args) => commands::call::handle(args, config).await?,
    }

    Ok(())
}
