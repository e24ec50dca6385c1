//! 目录锁文件
//!
//! 锁文件存在表示有同步正在进行。异常退出会留下过期的锁，
//! 需要手动清理（见 `maintenance::purge_locks`），不会被自动覆盖。

use crate::error::{SyncError, TargetError, TargetResult};
use crate::storage::{join_path, Target, LOCK_FILE_NAME};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 锁文件内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub lock_time: i64,
    #[serde(default)]
    pub generator: String,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            lock_time: chrono::Utc::now().timestamp(),
            generator: format!("treesync/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    fn describe(data: &[u8]) -> String {
        match serde_json::from_slice::<LockInfo>(data) {
            Ok(info) => {
                let time = chrono::DateTime::from_timestamp(info.lock_time, 0)
                    .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                format!("pid {} 于 {} 加锁", info.pid, time)
            }
            Err(_) => "锁文件内容无法识别".to_string(),
        }
    }
}

/// 目录被锁定时返回 `LockHeld`
pub async fn check(target: &dyn Target, dir: &str) -> Result<(), SyncError> {
    let path = join_path(dir, LOCK_FILE_NAME);
    if !target.exists(&path).await? {
        return Ok(());
    }

    let detail = match target.read(&path).await {
        Ok(data) => LockInfo::describe(&data),
        Err(e) => e.to_string(),
    };
    Err(SyncError::LockHeld {
        target: target.name().to_string(),
        path,
        detail,
    })
}

/// 检查并创建锁文件
pub async fn acquire(target: &dyn Target, dir: &str) -> Result<(), SyncError> {
    check(target, dir).await?;

    let path = join_path(dir, LOCK_FILE_NAME);
    let data = serde_json::to_vec_pretty(&LockInfo::current())
        .map_err(|e| TargetError::io(&path, std::io::Error::other(e)))?;
    target.write(&path, data).await?;

    debug!("加锁 {}:{}", target.name(), path);
    Ok(())
}

/// 删除锁文件
pub async fn release(target: &dyn Target, dir: &str) -> TargetResult<()> {
    let path = join_path(dir, LOCK_FILE_NAME);
    target.remove_file(&path).await?;
    debug!("解锁 {}:{}", target.name(), path);
    Ok(())
}

/// 强制删除锁文件，返回是否存在过
pub async fn force_release(target: &dyn Target, dir: &str) -> TargetResult<bool> {
    let path = join_path(dir, LOCK_FILE_NAME);
    if !target.exists(&path).await? {
        return Ok(false);
    }
    target.remove_file(&path).await?;
    info!("已清除锁文件 {}:{}", target.name(), path);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalTarget;

    #[tokio::test]
    async fn test_acquire_blocks_second_run() {
        let tmp = tempfile::tempdir().unwrap();
        let target = LocalTarget::new(tmp.path());

        acquire(&target, "").await.unwrap();
        assert!(tmp.path().join(LOCK_FILE_NAME).exists());

        match acquire(&target, "").await {
            Err(SyncError::LockHeld { path, detail, .. }) => {
                assert_eq!(path, LOCK_FILE_NAME);
                assert!(detail.contains(&std::process::id().to_string()));
            }
            other => panic!("expected LockHeld, got {:?}", other),
        }

        release(&target, "").await.unwrap();
        assert!(!tmp.path().join(LOCK_FILE_NAME).exists());
        check(&target, "").await.unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_lock_still_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub").join(LOCK_FILE_NAME), "garbage").unwrap();
        let target = LocalTarget::new(tmp.path());

        assert!(matches!(
            check(&target, "sub").await,
            Err(SyncError::LockHeld { .. })
        ));
        assert!(force_release(&target, "sub").await.unwrap());
        assert!(!force_release(&target, "sub").await.unwrap());
    }

    #[tokio::test]
    async fn test_readonly_target_is_not_locked() {
        let tmp = tempfile::tempdir().unwrap();
        let target = LocalTarget::new(tmp.path());
        target.set_readonly(true);

        acquire(&target, "").await.unwrap();
        assert!(!tmp.path().join(LOCK_FILE_NAME).exists());
    }
}
