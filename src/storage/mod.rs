pub mod local;
pub mod remote;

use crate::config::{TargetConfig, TargetType};
use crate::error::{TargetError, TargetResult};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub use local::LocalTarget;
pub use remote::RemoteTarget;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 每个目录下的元数据文件名
pub const META_FILE_NAME: &str = ".treesync-meta.json";
/// 同步进行中的锁文件名
pub const LOCK_FILE_NAME: &str = ".treesync-lock.json";
/// 任务配置文件名
pub const TASK_FILE_NAME: &str = "treesync.json";
/// 写入过程中的临时文件后缀
pub const TEMP_SUFFIX: &str = ".treesync-tmp";
/// 流式读取的块大小
pub const CHUNK_SIZE: usize = 256 * 1024;

/// 文件内容的字节流
pub type ByteStream = Pin<Box<dyn Stream<Item = TargetResult<Vec<u8>>> + Send>>;

/// 引擎内部使用的文件名，永远不参与同步
pub fn is_reserved_name(name: &str) -> bool {
    name == META_FILE_NAME
        || name == LOCK_FILE_NAME
        || name == TASK_FILE_NAME
        || name.ends_with(TEMP_SUFFIX)
}

/// 拼接相对路径（统一使用 /）
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// 文件条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// 相对于目标根目录的路径
    pub rel_path: String,
    pub size: u64,
    /// 修改时间（秒），已按目标时钟偏移校正
    pub mtime: i64,
    /// 后端返回的原始修改时间
    pub mtime_org: i64,
}

/// 目录条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub rel_path: String,
}

/// 列表中的单个条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entry {
    File(FileEntry),
    Dir(DirEntry),
}

impl Entry {
    pub fn file(dir: &str, name: &str, size: u64, mtime: i64, mtime_org: i64) -> Self {
        Entry::File(FileEntry {
            name: name.to_string(),
            rel_path: join_path(dir, name),
            size,
            mtime,
            mtime_org,
        })
    }

    pub fn dir(dir: &str, name: &str) -> Self {
        Entry::Dir(DirEntry {
            name: name.to_string(),
            rel_path: join_path(dir, name),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Entry::File(f) => &f.name,
            Entry::Dir(d) => &d.name,
        }
    }

    pub fn rel_path(&self) -> &str {
        match self {
            Entry::File(f) => &f.rel_path,
            Entry::Dir(d) => &d.rel_path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Dir(_))
    }

    pub fn as_file(&self) -> Option<&FileEntry> {
        match self {
            Entry::File(f) => Some(f),
            Entry::Dir(_) => None,
        }
    }
}

/// 只读标志：置位后所有写操作只记录不执行（dry-run 复用）
#[derive(Debug, Default)]
pub struct ReadOnlyFlag(AtomicBool);

impl ReadOnlyFlag {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, readonly: bool) {
        self.0.store(readonly, Ordering::SeqCst);
    }

    /// 只读时记录被模拟的操作并返回 true
    pub fn simulate(&self, target: &str, op: &str, path: &str) -> bool {
        if self.get() {
            debug!("[只读] {} {}: {}", target, op, path);
            true
        } else {
            false
        }
    }
}

/// 存储目标接口
///
/// 路径都是相对于目标根目录、以 `/` 分隔的字符串，空串表示根目录。
/// 所有调用都显式携带路径，没有"当前目录"状态。
#[async_trait]
pub trait Target: Send + Sync {
    /// 获取目标名称（用于日志）
    fn name(&self) -> &str;

    /// 建立会话
    async fn open(&self) -> TargetResult<()> {
        Ok(())
    }

    /// 关闭会话
    async fn close(&self) -> TargetResult<()> {
        Ok(())
    }

    /// 根目录是否存在
    async fn root_exists(&self) -> TargetResult<bool>;

    /// 列出目录的直接子条目，按名称排序；目录不存在时返回空列表
    async fn list_dir(&self, dir: &str) -> TargetResult<Vec<Entry>>;

    /// 获取单个条目
    async fn stat(&self, path: &str) -> TargetResult<Option<Entry>>;

    /// 读取整个文件（元数据、锁等小文件）
    async fn read(&self, path: &str) -> TargetResult<Vec<u8>>;

    /// 写入整个文件（自动创建父目录）
    async fn write(&self, path: &str, data: Vec<u8>) -> TargetResult<()>;

    /// 打开文件的读取流
    async fn read_stream(&self, path: &str) -> TargetResult<ByteStream>;

    /// 流式写入（自动创建父目录），返回写入的字节数
    async fn write_stream(&self, path: &str, stream: ByteStream) -> TargetResult<u64>;

    /// 创建目录
    async fn mkdir(&self, path: &str) -> TargetResult<()>;

    /// 删除文件，不存在时忽略
    async fn remove_file(&self, path: &str) -> TargetResult<()>;

    /// 递归删除目录，不存在时忽略
    async fn remove_dir(&self, path: &str) -> TargetResult<()>;

    /// 设置修改时间；后端不支持时返回 false
    async fn set_mtime(&self, path: &str, mtime: i64) -> TargetResult<bool>;

    fn readonly(&self) -> bool;

    fn set_readonly(&self, readonly: bool);

    /// 检查文件是否存在
    async fn exists(&self, path: &str) -> TargetResult<bool> {
        Ok(self.stat(path).await?.is_some())
    }
}

/// 流中缓冲的一块
#[derive(Default)]
struct Chunk {
    data: Vec<u8>,
    pos: usize,
}

impl Chunk {
    fn rest(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// 当前块用完时读下一块，流结束返回 false
    async fn fill(&mut self, stream: &mut ByteStream) -> TargetResult<bool> {
        while self.pos >= self.data.len() {
            match stream.try_next().await? {
                Some(data) => {
                    self.data = data;
                    self.pos = 0;
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }
}

/// 逐块比较两个流的内容，两侧的块大小可以不同
pub async fn same_content(mut a: ByteStream, mut b: ByteStream) -> TargetResult<bool> {
    let (mut left, mut right) = (Chunk::default(), Chunk::default());
    loop {
        let more_left = left.fill(&mut a).await?;
        let more_right = right.fill(&mut b).await?;
        if !more_left || !more_right {
            return Ok(more_left == more_right);
        }

        let n = left.rest().len().min(right.rest().len());
        if left.rest()[..n] != right.rest()[..n] {
            return Ok(false);
        }
        left.pos += n;
        right.pos += n;
    }
}

/// 根据配置创建存储实例
pub async fn create_target(config: &TargetConfig) -> TargetResult<Arc<dyn Target>> {
    match config.typ {
        TargetType::Local => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| TargetError::Connection("Local target requires path".into()))?;
            info!("初始化本地目标: {}", path);
            Ok(Arc::new(LocalTarget::new(path)) as Arc<dyn Target>)
        }
        TargetType::Ftp => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or_else(|| TargetError::Connection("FTP target requires endpoint".into()))?;
            info!("初始化FTP目标: endpoint={}, root={:?}", endpoint, config.root);
            let target = RemoteTarget::ftp(
                endpoint,
                config.username.as_deref(),
                config.password.as_deref(),
                config.root.as_deref(),
            )?
            .with_time_offset(config.time_offset);
            Ok(Arc::new(target) as Arc<dyn Target>)
        }
        #[cfg(unix)]
        TargetType::Sftp => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or_else(|| TargetError::Connection("SFTP target requires endpoint".into()))?;
            info!("初始化SFTP目标: endpoint={}, root={:?}", endpoint, config.root);
            let target = RemoteTarget::sftp(
                endpoint,
                config.username.as_deref(),
                config.key_file.as_deref(),
                config.root.as_deref(),
            )?
            .with_time_offset(config.time_offset);
            Ok(Arc::new(target) as Arc<dyn Target>)
        }
        #[cfg(not(unix))]
        TargetType::Sftp => Err(TargetError::Unsupported(
            "SFTP is only available on unix".into(),
        )),
    }
}
