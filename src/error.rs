//! 错误类型
//!
//! `TargetError` 来自存储后端，`SyncError` 是会中止整个同步运行的错误。
//! 单个条目的失败不会变成 `SyncError`，而是记录到报告里。

use std::io;
use thiserror::Error;

pub type TargetResult<T> = Result<T, TargetError>;

/// 存储后端错误
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("I/O 错误 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("后端错误 ({path}): {source}")]
    Backend {
        path: String,
        #[source]
        source: opendal::Error,
    },

    #[error("连接失败: {0}")]
    Connection(String),

    #[error("不支持的操作: {0}")]
    Unsupported(String),
}

impl TargetError {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        TargetError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn backend(path: impl Into<String>, source: opendal::Error) -> Self {
        TargetError::Backend {
            path: path.into(),
            source,
        }
    }

    /// 是否为连接级别的错误（需要中止整个运行）
    pub fn is_connectivity(&self) -> bool {
        match self {
            TargetError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
            ),
            TargetError::Backend { source, .. } => {
                source.is_temporary() || source.kind() == opendal::ErrorKind::ConfigInvalid
            }
            TargetError::Connection(_) => true,
            TargetError::Unsupported(_) => false,
        }
    }
}

/// 中止同步运行的错误
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("目录已被其他同步任务锁定: {target}:{path} ({detail})")]
    LockHeld {
        target: String,
        path: String,
        detail: String,
    },

    #[error("元数据版本不兼容: {path} 版本 {found}，期望 {expected}")]
    MetadataVersion {
        path: String,
        found: u32,
        expected: u32,
    },

    #[error("根目录不存在: {0}")]
    RootMissing(String),

    #[error("无效的匹配规则 '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Target(#[from] TargetError),
}

impl SyncError {
    /// 连接级别的错误会中止整个运行，其余只影响当前条目
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Target(e) if e.is_connectivity())
    }
}
