//! 7T 蓝斑核 CNR 定量命令行工具.
//!
//! 对数据目录下的全部 (或指定) 被试执行配准与定量, 结果写入
//! `<output_dir>/lc_cnr.csv`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

mod result;
mod runner;

/// 命令行参数.
#[derive(Parser, Debug)]
#[command(author, about, version, long_about = None)]
pub struct Args {
    /// JSON 配置文件. 缺省时读取 `$LC_CONFIG`, 再缺省时使用默认配置.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 只处理指定被试, 可重复给出 (如 `-s sub-01 -s sub-02`).
    #[arg(short, long = "subject")]
    subjects: Vec<String>,

    /// 复用输出目录中已配准的体数据, 跳过配准.
    #[arg(long)]
    skip_registration: bool,

    /// 覆盖配置中的输出目录.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 输出调试日志.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .init()
        .unwrap();

    match runner::run(&args) {
        Ok(report) => {
            report.analyze();
            if report.is_complete() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
