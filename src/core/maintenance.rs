//! 手动维护工具：清除过期锁和元数据

use crate::core::lock;
use crate::error::TargetResult;
use crate::storage::{join_path, Entry, Target, META_FILE_NAME};
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info};

/// 删除锁文件，`recursive` 时遍历整棵树；返回删除的数量
pub async fn purge_locks(target: &dyn Target, recursive: bool) -> TargetResult<usize> {
    let dirs = if recursive {
        collect_dirs(target, String::new()).await?
    } else {
        vec![String::new()]
    };

    let mut count = 0;
    for dir in &dirs {
        if lock::force_release(target, dir).await? {
            count += 1;
        }
    }

    info!("{}: 清除了 {} 个锁文件", target.name(), count);
    Ok(count)
}

/// 删除整棵树的元数据文件，下次同步会把目录当作未管理的树重新接管
pub async fn purge_metadata(target: &dyn Target) -> TargetResult<usize> {
    let mut count = 0;
    for dir in collect_dirs(target, String::new()).await? {
        let path = join_path(&dir, META_FILE_NAME);
        if target.exists(&path).await? {
            target.remove_file(&path).await?;
            debug!("删除元数据 {}:{}", target.name(), path);
            count += 1;
        }
    }

    info!("{}: 清除了 {} 个元数据文件", target.name(), count);
    Ok(count)
}

/// 先序收集 `dir` 及其下所有目录
fn collect_dirs(target: &dyn Target, dir: String) -> BoxFuture<'_, TargetResult<Vec<String>>> {
    async move {
        let mut dirs = vec![dir.clone()];
        for entry in target.list_dir(&dir).await? {
            if let Entry::Dir(sub) = entry {
                dirs.extend(collect_dirs(target, sub.rel_path).await?);
            }
        }
        Ok(dirs)
    }
    .boxed()
}
