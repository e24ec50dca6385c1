//! 运行统计、决策日志和报告回调

use crate::core::entry::Classification;
use crate::core::resolver::{Operation, SyncMode};
use serde::Serialize;
use tracing::{debug, info, warn};

/// 同步统计
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub dirs_visited: u64,
    pub files_compared: u64,
    pub entries_excluded: u64,
    pub equal: u64,
    pub copied_local: u64,
    pub copied_remote: u64,
    pub deleted_local: u64,
    pub deleted_remote: u64,
    pub dirs_created: u64,
    pub noop: u64,
    /// 遇到的冲突（包括被策略解决的）
    pub conflicts: u64,
    pub conflicts_resolved: u64,
    pub skipped: u64,
    pub errors: u64,
    pub bytes_written: u64,
    pub elapsed_ms: u64,
}

impl SyncStats {
    pub fn unresolved_conflicts(&self) -> u64 {
        self.conflicts.saturating_sub(self.conflicts_resolved)
    }

    /// 写入或删除的条目数
    pub fn changes(&self) -> u64 {
        self.copied_local
            + self.copied_remote
            + self.deleted_local
            + self.deleted_remote
            + self.dirs_created
    }
}

/// 单个条目对的决策
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub path: String,
    pub dir: bool,
    pub local: Classification,
    pub remote: Classification,
    /// 分类表给出的操作
    pub operation: Operation,
    /// 经过比较、模式限制和冲突策略后实际采取的操作
    pub action: Operation,
}

/// 同步报告
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub mode: SyncMode,
    pub dry_run: bool,
    pub cancelled: bool,
    pub stats: SyncStats,
    pub decisions: Vec<Decision>,
    pub errors: Vec<String>,
}

impl SyncReport {
    /// 没有错误、没有未解决冲突且没有被取消
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.stats.unresolved_conflicts() == 0 && !self.cancelled
    }

    pub fn decision(&self, path: &str) -> Option<&Decision> {
        self.decisions.iter().find(|d| d.path == path)
    }
}

/// 报告回调，由调用方在构造同步器时注入
pub trait Reporter: Send + Sync {
    fn on_dir(&self, _dir: &str) {}

    fn on_decision(&self, _decision: &Decision) {}

    fn on_error(&self, _path: &str, _error: &str) {}

    fn on_finish(&self, _report: &SyncReport) {}
}

/// 默认的空实现
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {}

/// 把决策写入 tracing 日志
///
/// verbose: 0 只输出汇总，1 输出变更，2 加上一致的条目，3 及以上再加目录。
#[derive(Debug, Default)]
pub struct TracingReporter {
    verbose: u8,
}

impl TracingReporter {
    pub fn new(verbose: u8) -> Self {
        Self { verbose }
    }
}

impl Reporter for TracingReporter {
    fn on_dir(&self, dir: &str) {
        if self.verbose >= 3 {
            info!("进入目录: /{}", dir);
        }
    }

    fn on_decision(&self, d: &Decision) {
        if d.dir && self.verbose < 3 {
            return;
        }
        let level = match d.action {
            Operation::Equal | Operation::Noop => 2,
            _ => 1,
        };
        if self.verbose < level {
            return;
        }
        if d.action == Operation::Conflict {
            warn!("冲突 {} ({}, {})", d.path, d.local, d.remote);
        } else {
            info!("{:<13} {} ({}, {})", d.action.to_string(), d.path, d.local, d.remote);
        }
    }

    fn on_error(&self, path: &str, error: &str) {
        warn!("同步失败 {}: {}", path, error);
    }

    fn on_finish(&self, report: &SyncReport) {
        let s = &report.stats;
        info!(
            "同步完成{}: 目录 {}, 一致 {}, 上传 {}, 下载 {}, 删除本地 {}, 删除远程 {}, 冲突 {} (已解决 {}), 跳过 {}, 错误 {}, 写入 {} 字节, 耗时 {}ms",
            if report.dry_run { " [dry-run]" } else { "" },
            s.dirs_visited,
            s.equal,
            s.copied_local,
            s.copied_remote,
            s.deleted_local,
            s.deleted_remote,
            s.conflicts,
            s.conflicts_resolved,
            s.skipped,
            s.errors,
            s.bytes_written,
            s.elapsed_ms
        );
        if report.cancelled {
            warn!("同步被取消");
        }
        debug!("排除 {} 个条目, 比较 {} 个文件", s.entries_excluded, s.files_compared);
    }
}
