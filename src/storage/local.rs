use super::{ByteStream, Entry, ReadOnlyFlag, Target, CHUNK_SIZE, TEMP_SUFFIX};
use crate::error::{TargetError, TargetResult};
use async_trait::async_trait;
use filetime::FileTime;
use futures::TryStreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

/// 本地文件系统目标
pub struct LocalTarget {
    base_path: PathBuf,
    name: String,
    readonly: ReadOnlyFlag,
}

impl LocalTarget {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let base_path = path.as_ref().to_path_buf();
        let name = format!("local:{}", base_path.display());
        Self {
            base_path,
            name,
            readonly: ReadOnlyFlag::default(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/').trim_start_matches('\\');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    fn mtime_secs(metadata: &std::fs::Metadata) -> i64 {
        metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64)
    }

    fn to_entry(dir: &str, name: &str, metadata: &std::fs::Metadata) -> Option<Entry> {
        if metadata.is_dir() {
            Some(Entry::dir(dir, name))
        } else if metadata.is_file() {
            let mtime = Self::mtime_secs(metadata);
            Some(Entry::file(dir, name, metadata.len(), mtime, mtime))
        } else {
            None
        }
    }

    /// 同目录下的临时文件路径
    fn temp_path(full_path: &Path) -> PathBuf {
        let mut temp_name = full_path.to_path_buf().into_os_string();
        temp_name.push(TEMP_SUFFIX);
        PathBuf::from(temp_name)
    }

    async fn create_parent(&self, path: &str, full_path: &Path) -> TargetResult<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TargetError::io(path, e))?;
        }
        Ok(())
    }

    /// 读下一块，文件结束时返回 None
    async fn read_chunk(
        mut file: fs::File,
        path: String,
    ) -> TargetResult<Option<(Vec<u8>, (fs::File, String))>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| TargetError::io(&path, e))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some((buf, (file, path))))
    }

    /// 把流写进临时文件
    async fn write_chunks(path: &str, temp_path: &Path, mut stream: ByteStream) -> TargetResult<u64> {
        let mut file = fs::File::create(temp_path)
            .await
            .map_err(|e| TargetError::io(path, e))?;

        let mut written = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| TargetError::io(path, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| TargetError::io(path, e))?;
        Ok(written)
    }

    fn split_path(path: &str) -> (&str, &str) {
        let path = path.trim_matches('/');
        match path.rfind('/') {
            Some(pos) => (&path[..pos], &path[pos + 1..]),
            None => ("", path),
        }
    }
}

#[async_trait]
impl Target for LocalTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn root_exists(&self) -> TargetResult<bool> {
        match fs::metadata(&self.base_path).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TargetError::io("", e)),
        }
    }

    async fn list_dir(&self, dir: &str) -> TargetResult<Vec<Entry>> {
        let full_path = self.resolve_path(dir);

        let mut read_dir = match fs::read_dir(&full_path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TargetError::io(dir, e)),
        };

        let mut entries = Vec::new();
        while let Some(item) = read_dir
            .next_entry()
            .await
            .map_err(|e| TargetError::io(dir, e))?
        {
            let name = match item.file_name().into_string() {
                Ok(n) => n,
                Err(raw) => {
                    warn!("跳过无法解码的文件名: {:?}", raw);
                    continue;
                }
            };

            // 跟随符号链接；悬空链接直接跳过
            let metadata = match fs::metadata(item.path()).await {
                Ok(m) => m,
                Err(e) => {
                    warn!("无法读取 {} 的属性: {}", item.path().display(), e);
                    continue;
                }
            };

            if let Some(entry) = Self::to_entry(dir, &name, &metadata) {
                entries.push(entry);
            }
        }

        entries.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> TargetResult<Option<Entry>> {
        match fs::metadata(self.resolve_path(path)).await {
            Ok(metadata) => {
                let (dir, name) = Self::split_path(path);
                Ok(Self::to_entry(dir, name, &metadata))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TargetError::io(path, e)),
        }
    }

    async fn read(&self, path: &str) -> TargetResult<Vec<u8>> {
        fs::read(self.resolve_path(path))
            .await
            .map_err(|e| TargetError::io(path, e))
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> TargetResult<()> {
        if self.readonly.simulate(&self.name, "write", path) {
            return Ok(());
        }

        let full_path = self.resolve_path(path);
        self.create_parent(path, &full_path).await?;

        // 先写临时文件，再原子重命名
        let temp_path = Self::temp_path(&full_path);
        fs::write(&temp_path, data)
            .await
            .map_err(|e| TargetError::io(path, e))?;
        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(TargetError::io(path, e));
        }

        Ok(())
    }

    async fn read_stream(&self, path: &str) -> TargetResult<ByteStream> {
        let file = fs::File::open(self.resolve_path(path))
            .await
            .map_err(|e| TargetError::io(path, e))?;

        let stream = futures::stream::try_unfold((file, path.to_string()), |(file, path)| {
            Self::read_chunk(file, path)
        });
        Ok(Box::pin(stream))
    }

    async fn write_stream(&self, path: &str, stream: ByteStream) -> TargetResult<u64> {
        if self.readonly.simulate(&self.name, "write_stream", path) {
            return Ok(0);
        }

        let full_path = self.resolve_path(path);
        self.create_parent(path, &full_path).await?;

        let temp_path = Self::temp_path(&full_path);
        let written = match Self::write_chunks(path, &temp_path, stream).await {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(TargetError::io(path, e));
        }

        Ok(written)
    }

    async fn mkdir(&self, path: &str) -> TargetResult<()> {
        if self.readonly.simulate(&self.name, "mkdir", path) {
            return Ok(());
        }
        fs::create_dir_all(self.resolve_path(path))
            .await
            .map_err(|e| TargetError::io(path, e))
    }

    async fn remove_file(&self, path: &str) -> TargetResult<()> {
        if self.readonly.simulate(&self.name, "remove_file", path) {
            return Ok(());
        }
        match fs::remove_file(self.resolve_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TargetError::io(path, e)),
        }
    }

    async fn remove_dir(&self, path: &str) -> TargetResult<()> {
        if self.readonly.simulate(&self.name, "remove_dir", path) {
            return Ok(());
        }
        match fs::remove_dir_all(self.resolve_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TargetError::io(path, e)),
        }
    }

    async fn set_mtime(&self, path: &str, mtime: i64) -> TargetResult<bool> {
        if self.readonly.simulate(&self.name, "set_mtime", path) {
            return Ok(true);
        }

        let full_path = self.resolve_path(path);
        tokio::task::spawn_blocking(move || {
            filetime::set_file_mtime(&full_path, FileTime::from_unix_time(mtime, 0))
        })
        .await
        .map_err(|e| TargetError::io(path, io::Error::other(e)))?
        .map_err(|e| TargetError::io(path, e))?;

        Ok(true)
    }

    fn readonly(&self) -> bool {
        self.readonly.get()
    }

    fn set_readonly(&self, readonly: bool) {
        self.readonly.set(readonly);
    }
}
