//! 分类对 → 操作的映射，以及单向同步模式的限制

use crate::core::entry::{Classification, EntryPair};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 对一个条目对执行的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// 两侧一致，只刷新元数据
    Equal,
    /// 本地覆盖远程
    CopyLocal,
    /// 远程覆盖本地
    CopyRemote,
    DeleteLocal,
    DeleteRemote,
    Conflict,
    /// 仅凭分类无法判断，需要比较内容
    NeedCompare,
    /// 两侧都不存在，只清理元数据
    Noop,
    /// 当前模式不允许，跳过
    Disallowed,
}

impl Operation {
    /// 是否会写入本地
    pub fn writes_local(self) -> bool {
        matches!(self, Operation::CopyRemote | Operation::DeleteLocal)
    }

    /// 是否会写入远程
    pub fn writes_remote(self) -> bool {
        matches!(self, Operation::CopyLocal | Operation::DeleteRemote)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Equal => "equal",
            Operation::CopyLocal => "copy_local",
            Operation::CopyRemote => "copy_remote",
            Operation::DeleteLocal => "delete_local",
            Operation::DeleteRemote => "delete_remote",
            Operation::Conflict => "conflict",
            Operation::NeedCompare => "need_compare",
            Operation::Noop => "noop",
            Operation::Disallowed => "disallowed",
        };
        write!(f, "{}", s)
    }
}

/// 根据两侧分类决定操作
pub fn resolve(local: Classification, remote: Classification) -> Operation {
    use Classification::*;
    use Operation::*;

    match (local, remote) {
        (Missing, Missing) => Disallowed,
        (Missing, New) => CopyRemote,
        (Missing, Unmodified) => CopyRemote,
        (Missing, Modified) => CopyRemote,
        (Missing, Deleted) => Noop,
        (Missing, Existing) => CopyRemote,

        (New, Missing) => CopyLocal,
        (New, New) => NeedCompare,
        (New, Unmodified) => NeedCompare,
        (New, Modified) => NeedCompare,
        (New, Deleted) => Conflict,
        (New, Existing) => NeedCompare,

        (Unmodified, Missing) => CopyLocal,
        (Unmodified, New) => NeedCompare,
        (Unmodified, Unmodified) => Equal,
        (Unmodified, Modified) => CopyRemote,
        (Unmodified, Deleted) => DeleteLocal,
        (Unmodified, Existing) => NeedCompare,

        (Modified, Missing) => CopyLocal,
        (Modified, New) => NeedCompare,
        (Modified, Unmodified) => CopyLocal,
        (Modified, Modified) => Conflict,
        (Modified, Deleted) => Conflict,
        (Modified, Existing) => NeedCompare,

        (Deleted, Missing) => Noop,
        (Deleted, New) => Conflict,
        (Deleted, Unmodified) => DeleteRemote,
        (Deleted, Modified) => Conflict,
        (Deleted, Deleted) => Noop,
        (Deleted, Existing) => NeedCompare,

        (Existing, Missing) => CopyLocal,
        (Existing, New) => NeedCompare,
        (Existing, Unmodified) => NeedCompare,
        (Existing, Modified) => NeedCompare,
        (Existing, Deleted) => NeedCompare,
        (Existing, Existing) => NeedCompare,
    }
}

/// 同步方向
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// 只写远程
    Upload,
    /// 只写本地
    Download,
    #[default]
    Bidirectional,
}

impl SyncMode {
    /// 当前模式是否允许该操作
    pub fn permits(self, op: Operation) -> bool {
        match self {
            SyncMode::Bidirectional => true,
            SyncMode::Upload => !op.writes_local(),
            SyncMode::Download => !op.writes_remote(),
        }
    }

    /// 把写入只读侧的操作改写
    ///
    /// 只在目标侧存在的条目：`delete_unmatched` 时删除，否则跳过。
    /// 其余写入只读侧的操作一律视为冲突，交给冲突策略。
    pub fn restrict(self, op: Operation, pair: &EntryPair, delete_unmatched: bool) -> Operation {
        if self.permits(op) {
            return op;
        }
        match (self, op) {
            (SyncMode::Upload, Operation::CopyRemote) if pair.local.is_none() => {
                if delete_unmatched {
                    Operation::DeleteRemote
                } else {
                    Operation::Disallowed
                }
            }
            (SyncMode::Download, Operation::CopyLocal) if pair.remote.is_none() => {
                if delete_unmatched {
                    Operation::DeleteLocal
                } else {
                    Operation::Disallowed
                }
            }
            _ => Operation::Conflict,
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Upload => write!(f, "upload"),
            SyncMode::Download => write!(f, "download"),
            SyncMode::Bidirectional => write!(f, "bidirectional"),
        }
    }
}
