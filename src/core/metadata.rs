//! 目录元数据 - 用于增量同步
//!
//! 每个同步过的目录在两侧各有一个元数据文件，记录上次同步成功时
//! 每个子条目的大小和两侧各自的修改时间。

use crate::core::entry::Side;
use crate::error::{SyncError, TargetError};
use crate::storage::{join_path, FileEntry, Target, META_FILE_NAME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// 当前元数据格式版本
pub const METADATA_VERSION: u32 = 2;

/// 单个条目的同步记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub size: u64,
    /// 同步时源文件的修改时间
    pub mtime: i64,
    pub synced_mtime_local: i64,
    pub synced_mtime_remote: i64,
    /// 同步完成的时间
    pub synced_at: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dir: bool,
}

impl MetaRecord {
    /// 两侧文件确认一致后的记录
    pub fn for_files(local: &FileEntry, remote: &FileEntry, source: Side) -> Self {
        let src = match source {
            Side::Local => local,
            Side::Remote => remote,
        };
        Self {
            size: src.size,
            mtime: src.mtime,
            synced_mtime_local: local.mtime,
            synced_mtime_remote: remote.mtime,
            synced_at: chrono::Utc::now().timestamp(),
            dir: false,
        }
    }

    pub fn for_dir() -> Self {
        Self {
            size: 0,
            mtime: 0,
            synced_mtime_local: 0,
            synced_mtime_remote: 0,
            synced_at: chrono::Utc::now().timestamp(),
            dir: true,
        }
    }

    pub fn synced_mtime(&self, side: Side) -> i64 {
        match side {
            Side::Local => self.synced_mtime_local,
            Side::Remote => self.synced_mtime_remote,
        }
    }

    /// 忽略 synced_at 比较内容
    fn same_state(&self, other: &MetaRecord) -> bool {
        self.size == other.size
            && self.mtime == other.mtime
            && self.synced_mtime_local == other.synced_mtime_local
            && self.synced_mtime_remote == other.synced_mtime_remote
            && self.dir == other.dir
    }
}

/// 元数据文件格式
#[derive(Debug, Serialize, Deserialize)]
struct MetaFile {
    version: u32,
    #[serde(default)]
    generator: String,
    #[serde(default)]
    saved_at: i64,
    #[serde(default)]
    entries: BTreeMap<String, MetaRecord>,
}

/// 只用于读取版本号
#[derive(Debug, Deserialize)]
struct VersionTag {
    version: u32,
}

/// 一个目录在一侧的元数据
#[derive(Debug, Clone, Default)]
pub struct DirMetadata {
    dir: String,
    entries: BTreeMap<String, MetaRecord>,
    /// 是否有可信的同步历史
    existed: bool,
    /// 目标上是否已有元数据文件（包括被丢弃的旧文件）
    on_disk: bool,
    dirty: bool,
}

impl DirMetadata {
    /// 空的元数据（目录之前没有元数据文件）
    pub fn empty(dir: &str) -> Self {
        Self {
            dir: dir.to_string(),
            ..Default::default()
        }
    }

    /// 目标上有文件但内容不可用：没有历史，下次保存时覆盖
    fn discarded(dir: &str) -> Self {
        Self {
            dir: dir.to_string(),
            on_disk: true,
            dirty: true,
            ..Default::default()
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// 是否有可信的同步历史；没有时条目只能分类为 existing
    pub fn existed(&self) -> bool {
        self.existed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&MetaRecord> {
        self.entries.get(name)
    }

    pub fn set(&mut self, name: &str, record: MetaRecord) {
        let changed = self
            .entries
            .get(name)
            .map_or(true, |old| !old.same_state(&record));
        if changed {
            self.entries.insert(name.to_string(), record);
            self.dirty = true;
        }
    }

    pub fn remove(&mut self, name: &str) {
        if self.entries.remove(name).is_some() {
            self.dirty = true;
        }
    }

    pub fn file_path(&self) -> String {
        join_path(&self.dir, META_FILE_NAME)
    }

    /// 解析元数据文件内容
    ///
    /// 版本不一致时：`migrate` 为 false 返回错误；为 true 则丢弃历史
    /// （视同没有元数据），下次保存时覆盖。损坏的文件同样丢弃。
    pub fn parse(dir: &str, data: &[u8], migrate: bool) -> Result<Self, SyncError> {
        let path = join_path(dir, META_FILE_NAME);

        let tag: VersionTag = match serde_json::from_slice(data) {
            Ok(p) => p,
            Err(e) => {
                warn!("元数据损坏，忽略: {} ({})", path, e);
                return Ok(Self::discarded(dir));
            }
        };

        let file = if tag.version == METADATA_VERSION {
            match serde_json::from_slice::<MetaFile>(data) {
                Ok(f) => f,
                Err(e) => {
                    warn!("元数据损坏，忽略: {} ({})", path, e);
                    return Ok(Self::discarded(dir));
                }
            }
        } else if !migrate {
            return Err(SyncError::MetadataVersion {
                path,
                found: tag.version,
                expected: METADATA_VERSION,
            });
        } else {
            // 其他版本的记录与当前的时间语义不兼容，只能丢弃
            warn!(
                "元数据版本 {} 与当前版本 {} 不兼容，丢弃同步历史: {}",
                tag.version, METADATA_VERSION, path
            );
            return Ok(Self::discarded(dir));
        };

        Ok(Self {
            dir: dir.to_string(),
            entries: file.entries,
            existed: true,
            on_disk: true,
            dirty: false,
        })
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let file = MetaFile {
            version: METADATA_VERSION,
            generator: format!("treesync/{}", env!("CARGO_PKG_VERSION")),
            saved_at: chrono::Utc::now().timestamp(),
            entries: self.entries.clone(),
        };
        serde_json::to_vec_pretty(&file)
    }

    /// 从目标读取目录的元数据，文件不存在时返回空元数据
    pub async fn load(target: &dyn Target, dir: &str, migrate: bool) -> Result<Self, SyncError> {
        let path = join_path(dir, META_FILE_NAME);
        if !target.exists(&path).await? {
            return Ok(Self::empty(dir));
        }
        let data = target.read(&path).await?;
        let meta = Self::parse(dir, &data, migrate)?;
        debug!("加载元数据 {}:{} ({} 条)", target.name(), path, meta.len());
        Ok(meta)
    }

    /// 写回目标（仅在有改动时）
    pub async fn flush(&mut self, target: &dyn Target) -> Result<(), SyncError> {
        if !self.dirty {
            return Ok(());
        }
        // 从未有过元数据且没有记录时不创建文件
        if !self.on_disk && self.entries.is_empty() {
            self.dirty = false;
            return Ok(());
        }

        let path = self.file_path();
        let data = self
            .to_bytes()
            .map_err(|e| TargetError::io(&path, std::io::Error::other(e)))?;
        target.write(&path, data).await?;

        debug!("保存元数据 {}:{} ({} 条)", target.name(), path, self.len());
        self.on_disk = true;
        self.dirty = false;
        Ok(())
    }
}
