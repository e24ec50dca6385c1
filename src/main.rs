use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};
use treesync_lib::logging::init_logging;
use treesync_lib::storage::TASK_FILE_NAME;
use treesync_lib::{create_target, Synchronizer, TaskConfig, TracingReporter};

/// 用法: treesync [任务文件]，默认读取当前目录下的 treesync.json
#[tokio::main]
async fn main() -> ExitCode {
    let task_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(TASK_FILE_NAME));

    let task = match TaskConfig::load(&task_path) {
        Ok(task) => task,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    // guard 需要存活到进程结束
    let _log_guard = init_logging(&task.log);

    match run(task).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("同步失败: {:#}", e);
            ExitCode::from(2)
        }
    }
}

/// 执行任务，返回是否完全成功
async fn run(task: TaskConfig) -> Result<bool> {
    let local = create_target(&task.local)
        .await
        .context("无法创建本地目标")?;
    let remote = create_target(&task.remote)
        .await
        .context("无法创建远程目标")?;

    let verbose = task.options.verbose;
    let synchronizer = Synchronizer::new(local, remote, task.options)
        .context("同步选项无效")?
        .with_reporter(Arc::new(TracingReporter::new(verbose)));

    // Ctrl-C 时在当前条目完成后停止
    let cancel = synchronizer.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，等待当前条目完成...");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let report = synchronizer.run().await?;
    let unresolved = report.stats.unresolved_conflicts();
    if unresolved > 0 {
        warn!("{} 个冲突未解决", unresolved);
    }
    if !report.errors.is_empty() {
        warn!("{} 个条目同步失败", report.errors.len());
    }
    if report.is_success() {
        info!("同步成功");
    }
    Ok(report.is_success())
}
