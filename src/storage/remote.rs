use super::{
    join_path, ByteStream, Entry, ReadOnlyFlag, Target, CHUNK_SIZE, IO_TIMEOUT_SECS,
    OP_TIMEOUT_SECS,
};
use crate::error::{TargetError, TargetResult};
use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, ErrorKind, Metadata, Metakey, Operator, Reader};
use std::time::Duration;
use tracing::debug;

/// 基于 opendal 的远程目标（FTP/FTPS/SFTP）
///
/// 这些后端无法设置修改时间，写入后的实际 mtime 由元数据记录按侧保存。
pub struct RemoteTarget {
    operator: Operator,
    name: String,
    /// 服务器时钟偏移（秒），加到列出的 mtime 上
    time_offset: i64,
    readonly: ReadOnlyFlag,
}

impl RemoteTarget {
    pub fn ftp(
        endpoint: &str,
        username: Option<&str>,
        password: Option<&str>,
        root: Option<&str>,
    ) -> TargetResult<Self> {
        use opendal::services::Ftp;

        let mut builder = Ftp::default().endpoint(endpoint);
        if let Some(u) = username {
            builder = builder.user(u);
        }
        if let Some(p) = password {
            builder = builder.password(p);
        }
        if let Some(r) = root {
            builder = builder.root(r);
        }

        let operator = Operator::new(builder)
            .map_err(|e| TargetError::backend(endpoint, e))?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        Ok(Self::from_operator(operator, Self::display_name(endpoint, root)))
    }

    #[cfg(unix)]
    pub fn sftp(
        endpoint: &str,
        username: Option<&str>,
        key_file: Option<&str>,
        root: Option<&str>,
    ) -> TargetResult<Self> {
        use opendal::services::Sftp;

        // 主机密钥校验交给 ssh 的 known_hosts
        let mut builder = Sftp::default()
            .endpoint(endpoint)
            .known_hosts_strategy("strict");
        if let Some(u) = username {
            builder = builder.user(u);
        }
        if let Some(k) = key_file {
            builder = builder.key(k);
        }
        if let Some(r) = root {
            builder = builder.root(r);
        }

        let operator = Operator::new(builder)
            .map_err(|e| TargetError::backend(endpoint, e))?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        Ok(Self::from_operator(operator, Self::display_name(endpoint, root)))
    }

    pub fn from_operator(operator: Operator, name: String) -> Self {
        Self {
            operator,
            name,
            time_offset: 0,
            readonly: ReadOnlyFlag::default(),
        }
    }

    pub fn with_time_offset(mut self, seconds: i64) -> Self {
        self.time_offset = seconds;
        self
    }

    fn display_name(endpoint: &str, root: Option<&str>) -> String {
        format!(
            "{}{}",
            endpoint.trim_end_matches('/'),
            root.map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        )
    }

    /// opendal 的目录路径必须以 / 结尾
    fn dir_path(dir: &str) -> String {
        let dir = dir.trim_matches('/');
        if dir.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", dir)
        }
    }

    /// 逐级创建父目录，已存在的忽略
    async fn ensure_parents(&self, path: &str) {
        let Some(pos) = path.rfind('/') else {
            return;
        };
        let mut current = String::new();
        for part in path[..pos].split('/').filter(|s| !s.is_empty()) {
            current = join_path(&current, part);
            if let Err(e) = self.operator.create_dir(&Self::dir_path(&current)).await {
                debug!("创建目录 {} 失败（忽略）: {}", current, e);
            }
        }
    }

    /// 按范围读下一块
    async fn read_chunk(
        reader: Reader,
        path: String,
        offset: u64,
        size: u64,
    ) -> TargetResult<Option<(Vec<u8>, (Reader, String, u64))>> {
        if offset >= size {
            return Ok(None);
        }
        let end = (offset + CHUNK_SIZE as u64).min(size);
        let data = reader
            .read(offset..end)
            .await
            .map_err(|e| TargetError::backend(&path, e))?
            .to_vec();
        if data.is_empty() {
            return Ok(None);
        }
        let next = offset + data.len() as u64;
        Ok(Some((data, (reader, path, next))))
    }

    fn to_entry(&self, dir: &str, name: &str, meta: &Metadata) -> Entry {
        if meta.is_dir() {
            Entry::dir(dir, name)
        } else {
            let mtime_org = meta.last_modified().map_or(0, |t| t.timestamp());
            Entry::file(
                dir,
                name,
                meta.content_length(),
                mtime_org + self.time_offset,
                mtime_org,
            )
        }
    }
}

#[async_trait]
impl Target for RemoteTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> TargetResult<()> {
        self.operator
            .check()
            .await
            .map_err(|e| TargetError::Connection(format!("{}: {}", self.name, e)))
    }

    async fn root_exists(&self) -> TargetResult<bool> {
        match self.operator.stat("/").await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TargetError::backend("/", e)),
        }
    }

    async fn list_dir(&self, dir: &str) -> TargetResult<Vec<Entry>> {
        let path = Self::dir_path(dir);

        let mut lister = match self
            .operator
            .lister_with(&path)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await
        {
            Ok(l) => l,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TargetError::backend(&path, e)),
        };

        let own_path = path.trim_start_matches('/');
        let mut entries = Vec::new();
        while let Some(item) = lister
            .try_next()
            .await
            .map_err(|e| TargetError::backend(&path, e))?
        {
            // 部分后端会把目录自身也列出来
            let item_path = item.path().trim_start_matches('/');
            if item_path.is_empty() || item_path == own_path {
                continue;
            }

            let name = item.name().trim_end_matches('/');
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            entries.push(self.to_entry(dir, name, item.metadata()));
        }

        entries.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> TargetResult<Option<Entry>> {
        let path = path.trim_matches('/');
        match self.operator.stat(path).await {
            Ok(meta) => {
                let (dir, name) = match path.rfind('/') {
                    Some(pos) => (&path[..pos], &path[pos + 1..]),
                    None => ("", path),
                };
                Ok(Some(self.to_entry(dir, name, &meta)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TargetError::backend(path, e)),
        }
    }

    async fn read(&self, path: &str) -> TargetResult<Vec<u8>> {
        let data = self
            .operator
            .read(path)
            .await
            .map_err(|e| TargetError::backend(path, e))?;
        Ok(data.to_vec())
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> TargetResult<()> {
        if self.readonly.simulate(&self.name, "write", path) {
            return Ok(());
        }

        let path = path.trim_start_matches('/');
        self.ensure_parents(path).await;

        self.operator
            .write(path, data)
            .await
            .map_err(|e| TargetError::backend(path, e))?;
        Ok(())
    }

    async fn read_stream(&self, path: &str) -> TargetResult<ByteStream> {
        let path = path.trim_start_matches('/').to_string();
        let size = self
            .operator
            .stat(&path)
            .await
            .map_err(|e| TargetError::backend(&path, e))?
            .content_length();
        let reader = self
            .operator
            .reader(&path)
            .await
            .map_err(|e| TargetError::backend(&path, e))?;

        let stream = futures::stream::try_unfold((reader, path, 0u64), move |(reader, path, offset)| {
            Self::read_chunk(reader, path, offset, size)
        });
        Ok(Box::pin(stream))
    }

    async fn write_stream(&self, path: &str, mut stream: ByteStream) -> TargetResult<u64> {
        if self.readonly.simulate(&self.name, "write_stream", path) {
            return Ok(0);
        }

        let path = path.trim_start_matches('/');
        self.ensure_parents(path).await;

        let mut writer = self
            .operator
            .writer(path)
            .await
            .map_err(|e| TargetError::backend(path, e))?;

        let mut written = 0u64;
        let result: TargetResult<()> = async {
            while let Some(chunk) = stream.try_next().await? {
                written += chunk.len() as u64;
                writer
                    .write(chunk)
                    .await
                    .map_err(|e| TargetError::backend(path, e))?;
            }
            writer
                .close()
                .await
                .map_err(|e| TargetError::backend(path, e))?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            // 放弃未完成的上传
            let _ = writer.abort().await;
            return Err(e);
        }
        Ok(written)
    }

    async fn mkdir(&self, path: &str) -> TargetResult<()> {
        if self.readonly.simulate(&self.name, "mkdir", path) {
            return Ok(());
        }
        let dir_path = Self::dir_path(path);
        self.operator
            .create_dir(&dir_path)
            .await
            .map_err(|e| TargetError::backend(&dir_path, e))
    }

    async fn remove_file(&self, path: &str) -> TargetResult<()> {
        if self.readonly.simulate(&self.name, "remove_file", path) {
            return Ok(());
        }
        match self.operator.delete(path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TargetError::backend(path, e)),
        }
    }

    async fn remove_dir(&self, path: &str) -> TargetResult<()> {
        if self.readonly.simulate(&self.name, "remove_dir", path) {
            return Ok(());
        }
        let dir_path = Self::dir_path(path);
        match self.operator.remove_all(&dir_path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TargetError::backend(dir_path, e)),
        }
    }

    async fn set_mtime(&self, _path: &str, _mtime: i64) -> TargetResult<bool> {
        Ok(false)
    }

    fn readonly(&self) -> bool {
        self.readonly.get()
    }

    fn set_readonly(&self, readonly: bool) {
        self.readonly.set(readonly);
    }
}
