//! 任务配置模块

use crate::core::classifier::DEFAULT_MTIME_TOLERANCE_SECS;
use crate::core::conflict::ConflictPolicy;
use crate::core::filter::DEFAULT_EXCLUDES;
use crate::core::resolver::SyncMode;
use crate::logging::LogConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Local,
    Ftp,
    Sftp,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub typ: TargetType,
    /// 本地路径
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// 远程地址，如 `ftp://host:21`、`ssh://host:22`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// SFTP 私钥文件
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// 远程根目录
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// 服务器时钟偏差（秒），加到列出的修改时间上
    #[serde(default)]
    pub time_offset: i64,
}

impl TargetConfig {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            typ: TargetType::Local,
            path: Some(path.into()),
            endpoint: None,
            username: None,
            password: None,
            key_file: None,
            root: None,
            time_offset: 0,
        }
    }
}

/// 同步选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    #[serde(default)]
    pub mode: SyncMode,
    /// 只计算并报告，不修改任何一侧
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// 0 只输出汇总，1 变更，2 加上一致条目，3 加上目录
    #[serde(default)]
    pub verbose: u8,
    /// 逗号分隔的包含规则（只作用于文件）
    #[serde(default)]
    pub match_patterns: Option<String>,
    /// 逗号分隔的排除规则
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Option<String>,
    /// 远程根目录不存在时创建
    #[serde(default)]
    pub create_folders: bool,
    /// 单向同步时删除目标侧多出的条目
    #[serde(default)]
    pub delete_unmatched: bool,
    /// 允许丢弃不兼容版本的元数据
    #[serde(default)]
    pub migrate: bool,
    #[serde(default = "default_mtime_tolerance")]
    pub mtime_tolerance_secs: i64,
}

fn default_exclude_patterns() -> Option<String> {
    Some(DEFAULT_EXCLUDES.to_string())
}

fn default_mtime_tolerance() -> i64 {
    DEFAULT_MTIME_TOLERANCE_SECS
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            dry_run: false,
            conflict_policy: ConflictPolicy::default(),
            verbose: 0,
            match_patterns: None,
            exclude_patterns: default_exclude_patterns(),
            create_folders: false,
            delete_unmatched: false,
            migrate: false,
            mtime_tolerance_secs: default_mtime_tolerance(),
        }
    }
}

/// 任务文件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub local: TargetConfig,
    pub remote: TargetConfig,
    #[serde(default)]
    pub options: SyncOptions,
    #[serde(default)]
    pub log: LogConfig,
}

impl TaskConfig {
    /// 从 JSON 任务文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取任务文件: {}", path.display()))?;
        let task: TaskConfig = serde_json::from_str(&content)
            .with_context(|| format!("任务文件格式错误: {}", path.display()))?;
        Ok(task)
    }

    /// 保存任务文件
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("无法写入任务文件: {}", path.display()))
    }
}
