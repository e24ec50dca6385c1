//! 两个本地目录之间的端到端同步场景

use async_trait::async_trait;
use filetime::FileTime;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use treesync_lib::core::{purge_locks, Classification, MetaRecord, METADATA_VERSION};
use treesync_lib::error::TargetResult;
use treesync_lib::storage::{ByteStream, Entry, LOCK_FILE_NAME, META_FILE_NAME};
use treesync_lib::{
    ConflictPolicy, LocalTarget, Operation, Reporter, SyncError, SyncMode, SyncOptions,
    SyncReport, Synchronizer, Target, TargetError,
};

const T0: i64 = 1_700_000_000;

struct Fixture {
    local: TempDir,
    remote: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            local: tempfile::tempdir().unwrap(),
            remote: tempfile::tempdir().unwrap(),
        }
    }

    fn l(&self) -> &Path {
        self.local.path()
    }

    fn r(&self) -> &Path {
        self.remote.path()
    }

    fn synchronizer(&self, local: Arc<dyn Target>, options: SyncOptions) -> Synchronizer {
        Synchronizer::new(local, Arc::new(LocalTarget::new(self.r())), options).unwrap()
    }

    async fn run(&self, options: SyncOptions) -> Result<SyncReport, SyncError> {
        self.synchronizer(Arc::new(LocalTarget::new(self.l())), options)
            .run()
            .await
    }

    async fn sync(&self) -> SyncReport {
        self.run(SyncOptions::default()).await.unwrap()
    }

    async fn sync_err(&self) -> SyncError {
        self.run(SyncOptions::default()).await.unwrap_err()
    }
}

fn write(path: &Path, content: &str, mtime: i64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
    filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
}

fn mtime(path: &Path) -> i64 {
    FileTime::from_last_modification_time(&fs::metadata(path).unwrap()).unix_seconds()
}

fn records(dir: &Path) -> BTreeMap<String, MetaRecord> {
    let raw: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.join(META_FILE_NAME)).unwrap()).unwrap();
    assert_eq!(raw["version"], METADATA_VERSION);
    serde_json::from_value(raw["entries"].clone()).unwrap()
}

/// 目录树快照：相对路径 -> (内容, mtime)
fn snapshot(root: &Path) -> BTreeMap<String, (Vec<u8>, i64)> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, (Vec<u8>, i64)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let rel = path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            if path.is_dir() {
                out.insert(format!("{}/", rel), (Vec::new(), 0));
                walk(root, &path, out);
            } else {
                out.insert(rel, (fs::read(&path).unwrap(), mtime(&path)));
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

/// 不含元数据文件的目录树快照
fn tree(root: &Path) -> BTreeMap<String, (Vec<u8>, i64)> {
    snapshot(root)
        .into_iter()
        .filter(|(path, _)| !path.ends_with(META_FILE_NAME))
        .collect()
}

/// 读取指定文件时报权限错误，其余操作交给本地目标
struct UnreadableFile {
    inner: LocalTarget,
    path: &'static str,
}

impl UnreadableFile {
    fn new(root: &Path, path: &'static str) -> Arc<dyn Target> {
        Arc::new(Self {
            inner: LocalTarget::new(root),
            path,
        })
    }

    fn check(&self, path: &str) -> TargetResult<()> {
        if path == self.path {
            return Err(TargetError::io(path, io::Error::from(io::ErrorKind::PermissionDenied)));
        }
        Ok(())
    }
}

#[async_trait]
impl Target for UnreadableFile {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn root_exists(&self) -> TargetResult<bool> {
        self.inner.root_exists().await
    }

    async fn list_dir(&self, dir: &str) -> TargetResult<Vec<Entry>> {
        self.inner.list_dir(dir).await
    }

    async fn stat(&self, path: &str) -> TargetResult<Option<Entry>> {
        self.inner.stat(path).await
    }

    async fn read(&self, path: &str) -> TargetResult<Vec<u8>> {
        self.check(path)?;
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> TargetResult<()> {
        self.inner.write(path, data).await
    }

    async fn read_stream(&self, path: &str) -> TargetResult<ByteStream> {
        self.check(path)?;
        self.inner.read_stream(path).await
    }

    async fn write_stream(&self, path: &str, stream: ByteStream) -> TargetResult<u64> {
        self.inner.write_stream(path, stream).await
    }

    async fn mkdir(&self, path: &str) -> TargetResult<()> {
        self.inner.mkdir(path).await
    }

    async fn remove_file(&self, path: &str) -> TargetResult<()> {
        self.inner.remove_file(path).await
    }

    async fn remove_dir(&self, path: &str) -> TargetResult<()> {
        self.inner.remove_dir(path).await
    }

    async fn set_mtime(&self, path: &str, mtime: i64) -> TargetResult<bool> {
        self.inner.set_mtime(path, mtime).await
    }

    fn readonly(&self) -> bool {
        self.inner.readonly()
    }

    fn set_readonly(&self, readonly: bool) {
        self.inner.set_readonly(readonly);
    }
}

/// 进入指定目录时请求取消
struct CancelAtDir {
    dir: &'static str,
    handle: Arc<AtomicBool>,
}

impl Reporter for CancelAtDir {
    fn on_dir(&self, dir: &str) {
        if dir == self.dir {
            self.handle.store(true, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn scenario_a_remote_only_file_is_downloaded() {
    let fx = Fixture::new();
    write(&fx.r().join("a.txt"), "0123456789", T0);

    let report = fx.sync().await;

    let d = report.decision("a.txt").unwrap();
    assert_eq!((d.local, d.remote), (Classification::Missing, Classification::Existing));
    assert_eq!(d.action, Operation::CopyRemote);
    assert_eq!(fs::read_to_string(fx.l().join("a.txt")).unwrap(), "0123456789");
    assert_eq!(mtime(&fx.l().join("a.txt")), T0);

    for side in [fx.l(), fx.r()] {
        let rec = &records(side)["a.txt"];
        assert_eq!(rec.size, 10);
        assert_eq!(rec.mtime, T0);
        assert_eq!(rec.synced_mtime_local, T0);
        assert_eq!(rec.synced_mtime_remote, T0);
    }
    assert_eq!(report.stats.copied_remote, 1);
    assert_eq!(report.stats.bytes_written, 10);
    assert!(report.is_success());
}

#[tokio::test]
async fn scenario_b_local_change_overwrites_remote() {
    let fx = Fixture::new();
    write(&fx.l().join("a.txt"), "first", T0);
    fx.sync().await;

    write(&fx.l().join("a.txt"), "second version", T0 + 100);
    let report = fx.sync().await;

    let d = report.decision("a.txt").unwrap();
    assert_eq!((d.local, d.remote), (Classification::Modified, Classification::Unmodified));
    assert_eq!(d.action, Operation::CopyLocal);
    assert_eq!(fs::read_to_string(fx.r().join("a.txt")).unwrap(), "second version");

    let rec = &records(fx.r())["a.txt"];
    assert_eq!(rec.size, 14);
    assert_eq!(rec.synced_mtime_remote, T0 + 100);
}

#[tokio::test]
async fn scenario_c_conflict_skip_then_local_wins() {
    let fx = Fixture::new();
    write(&fx.l().join("a.txt"), "base", T0);
    fx.sync().await;

    write(&fx.l().join("a.txt"), "local edit", T0 + 10);
    write(&fx.r().join("a.txt"), "remote edit!", T0 + 20);

    let report = fx.sync().await;
    assert_eq!(report.decision("a.txt").unwrap().action, Operation::Conflict);
    assert_eq!(report.stats.conflicts, 1);
    assert_eq!(report.stats.unresolved_conflicts(), 1);
    assert!(!report.is_success());
    assert_eq!(fs::read_to_string(fx.l().join("a.txt")).unwrap(), "local edit");
    assert_eq!(fs::read_to_string(fx.r().join("a.txt")).unwrap(), "remote edit!");

    let options = SyncOptions {
        conflict_policy: ConflictPolicy::LocalWins,
        ..Default::default()
    };
    let report = fx.run(options).await.unwrap();
    let d = report.decision("a.txt").unwrap();
    assert_eq!(d.operation, Operation::Conflict);
    assert_eq!(d.action, Operation::CopyLocal);
    assert_eq!(report.stats.conflicts, 1);
    assert_eq!(report.stats.conflicts_resolved, 1);
    assert!(report.is_success());
    assert_eq!(fs::read_to_string(fx.r().join("a.txt")).unwrap(), "local edit");
}

#[tokio::test]
async fn scenario_d_local_delete_propagates() {
    let fx = Fixture::new();
    write(&fx.l().join("a.txt"), "doomed", T0);
    write(&fx.l().join("b.txt"), "kept", T0);
    fx.sync().await;

    fs::remove_file(fx.l().join("a.txt")).unwrap();
    let report = fx.sync().await;

    let d = report.decision("a.txt").unwrap();
    assert_eq!((d.local, d.remote), (Classification::Deleted, Classification::Unmodified));
    assert_eq!(d.action, Operation::DeleteRemote);
    assert!(!fx.r().join("a.txt").exists());
    assert!(fx.r().join("b.txt").exists());
    for side in [fx.l(), fx.r()] {
        let recs = records(side);
        assert!(!recs.contains_key("a.txt"));
        assert!(recs.contains_key("b.txt"));
    }
}

#[tokio::test]
async fn scenario_e_old_metadata_version() {
    let fx = Fixture::new();
    write(&fx.l().join("a.txt"), "same", T0);
    write(&fx.r().join("a.txt"), "same", T0);
    write(&fx.r().join("new.txt"), "fresh", T0);
    fs::write(
        fx.l().join(META_FILE_NAME),
        r#"{"version": 1, "entries": {"a.txt": {"size": 4, "mtime": 1}}}"#,
    )
    .unwrap();
    let before = (snapshot(fx.l()), snapshot(fx.r()));

    let err = fx.sync_err().await;
    match err {
        SyncError::MetadataVersion { found, expected, .. } => {
            assert_eq!(found, 1);
            assert_eq!(expected, METADATA_VERSION);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!((snapshot(fx.l()), snapshot(fx.r())), before);

    let options = SyncOptions {
        migrate: true,
        ..Default::default()
    };
    let report = fx.run(options).await.unwrap();
    let d = report.decision("a.txt").unwrap();
    assert_eq!((d.local, d.remote), (Classification::Existing, Classification::Existing));
    assert_eq!(d.operation, Operation::NeedCompare);
    assert_eq!(d.action, Operation::Equal);
    assert_eq!(report.decision("new.txt").unwrap().action, Operation::CopyRemote);

    // 旧文件已被当前版本覆盖
    assert!(records(fx.l()).contains_key("a.txt"));
    fx.sync().await;
}

#[tokio::test]
async fn second_run_is_idempotent() {
    let fx = Fixture::new();
    write(&fx.l().join("a.txt"), "a", T0);
    write(&fx.l().join("docs/readme.md"), "readme", T0 + 1);
    write(&fx.r().join("b.txt"), "b", T0 + 2);
    write(&fx.r().join("photos/2024/x.jpg"), "jpeg", T0 + 3);

    let first = fx.sync().await;
    assert!(first.stats.changes() > 0);
    assert_eq!(snapshot(fx.l()).len(), snapshot(fx.r()).len());

    let second = fx.sync().await;
    assert_eq!(second.stats.changes(), 0);
    assert_eq!(second.stats.conflicts, 0);
    for d in &second.decisions {
        assert_eq!(
            (d.local, d.remote, d.action),
            (Classification::Unmodified, Classification::Unmodified, Operation::Equal),
            "{}",
            d.path
        );
    }
    assert_eq!(second.stats.equal, 4);
}

#[tokio::test]
async fn dry_run_changes_nothing_and_matches_real_run() {
    let fx = Fixture::new();
    write(&fx.l().join("a.txt"), "a", T0);
    write(&fx.r().join("sub/b.txt"), "b", T0);
    fx.sync().await;

    write(&fx.l().join("a.txt"), "a changed", T0 + 50);
    write(&fx.l().join("c.txt"), "c", T0);
    fs::remove_file(fx.r().join("sub/b.txt")).unwrap();
    let before = (snapshot(fx.l()), snapshot(fx.r()));

    let options = SyncOptions {
        dry_run: true,
        ..Default::default()
    };
    let dry = fx.run(options).await.unwrap();
    assert!(dry.dry_run);
    assert_eq!((snapshot(fx.l()), snapshot(fx.r())), before);

    let real = fx.sync().await;
    assert_eq!(dry.decisions, real.decisions);
    assert_eq!(dry.stats.copied_local, real.stats.copied_local);
    assert_eq!(dry.stats.deleted_local, real.stats.deleted_local);
    assert!(!fx.l().join("sub/b.txt").exists());
    assert_eq!(fs::read_to_string(fx.r().join("a.txt")).unwrap(), "a changed");
}

#[tokio::test]
async fn lock_held_blocks_run_until_purged() {
    let fx = Fixture::new();
    write(&fx.l().join("a.txt"), "a", T0);
    fs::write(fx.r().join(LOCK_FILE_NAME), r#"{"pid": 4242, "lock_time": 0}"#).unwrap();

    match fx.sync_err().await {
        SyncError::LockHeld { detail, .. } => assert!(detail.contains("4242")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!fx.r().join("a.txt").exists());
    // 本地没有留下锁
    assert!(!fx.l().join(LOCK_FILE_NAME).exists());

    let remote = LocalTarget::new(fx.r());
    assert_eq!(purge_locks(&remote, false).await.unwrap(), 1);

    fx.sync().await;
    assert!(fx.r().join("a.txt").exists());
    assert!(!fx.l().join(LOCK_FILE_NAME).exists());
    assert!(!fx.r().join(LOCK_FILE_NAME).exists());
}

#[tokio::test]
async fn locked_subdirectory_is_skipped() {
    let fx = Fixture::new();
    write(&fx.l().join("busy/a.txt"), "a", T0);
    write(&fx.l().join("free/b.txt"), "b", T0);
    write(&fx.r().join("busy").join(LOCK_FILE_NAME), "{}", T0);

    let report = fx.sync().await;

    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("busy"));
    assert!(!fx.r().join("busy/a.txt").exists());
    assert!(fx.r().join("free/b.txt").exists());
}

#[tokio::test]
async fn upload_mode_never_writes_local() {
    let fx = Fixture::new();
    write(&fx.l().join("mine.txt"), "mine", T0);
    write(&fx.r().join("theirs.txt"), "theirs", T0);

    let options = SyncOptions {
        mode: SyncMode::Upload,
        ..Default::default()
    };
    let report = fx.run(options.clone()).await.unwrap();

    assert!(fx.r().join("mine.txt").exists());
    assert!(!fx.l().join("theirs.txt").exists());
    assert_eq!(report.decision("theirs.txt").unwrap().action, Operation::Disallowed);
    assert_eq!(report.stats.skipped, 1);

    let options = SyncOptions {
        delete_unmatched: true,
        ..options
    };
    let report = fx.run(options).await.unwrap();
    assert_eq!(report.decision("theirs.txt").unwrap().action, Operation::DeleteRemote);
    assert!(!fx.r().join("theirs.txt").exists());
    assert!(!fx.l().join("theirs.txt").exists());
}

#[tokio::test]
async fn directories_are_created_and_removed() {
    let fx = Fixture::new();
    write(&fx.l().join("a/b/c/deep.txt"), "deep", T0);
    write(&fx.l().join("a/top.txt"), "top", T0);

    let report = fx.sync().await;
    assert_eq!(report.stats.dirs_created, 3);
    assert_eq!(fs::read_to_string(fx.r().join("a/b/c/deep.txt")).unwrap(), "deep");
    assert!(fx.r().join("a/b/c").join(META_FILE_NAME).exists());
    assert!(records(fx.r())["a"].dir);

    fs::remove_dir_all(fx.l().join("a/b")).unwrap();
    let report = fx.sync().await;

    let d = report.decision("a/b").unwrap();
    assert!(d.dir);
    assert_eq!((d.local, d.remote), (Classification::Deleted, Classification::Unmodified));
    assert_eq!(d.action, Operation::DeleteRemote);
    let deep = report.decision("a/b/c/deep.txt").unwrap();
    assert_eq!((deep.local, deep.remote), (Classification::Deleted, Classification::Unmodified));
    assert_eq!(deep.action, Operation::DeleteRemote);
    assert_eq!(report.stats.deleted_remote, 3);
    assert!(!fx.r().join("a/b").exists());
    assert!(fx.r().join("a/top.txt").exists());
    assert!(!records(fx.r().join("a").as_path()).contains_key("b"));
}

#[tokio::test]
async fn removed_directory_keeps_locally_modified_child() {
    let fx = Fixture::new();
    write(&fx.l().join("d/a.txt"), "original", T0);
    fx.sync().await;
    assert!(fx.r().join("d/a.txt").exists());

    fs::remove_dir_all(fx.r().join("d")).unwrap();
    write(&fx.l().join("d/a.txt"), "edited locally", T0 + 100);

    let report = fx.sync().await;

    let d = report.decision("d").unwrap();
    assert_eq!((d.local, d.remote), (Classification::Unmodified, Classification::Deleted));
    let a = report.decision("d/a.txt").unwrap();
    assert_eq!((a.local, a.remote), (Classification::Modified, Classification::Deleted));
    assert_eq!(a.action, Operation::Conflict);
    assert_eq!(report.stats.unresolved_conflicts(), 1);
    assert_eq!(report.stats.deleted_local, 0);
    assert_eq!(fs::read_to_string(fx.l().join("d/a.txt")).unwrap(), "edited locally");
    assert!(!fx.r().join("d").exists());
}

#[tokio::test]
async fn removed_directory_keeps_new_child() {
    let fx = Fixture::new();
    write(&fx.l().join("d/a.txt"), "a", T0);
    fx.sync().await;

    fs::remove_dir_all(fx.r().join("d")).unwrap();
    write(&fx.l().join("d/new.txt"), "never synced", T0 + 50);

    let report = fx.sync().await;

    assert_eq!(report.decision("d/a.txt").unwrap().action, Operation::DeleteLocal);
    let new = report.decision("d/new.txt").unwrap();
    assert_eq!((new.local, new.remote), (Classification::New, Classification::Missing));
    assert_eq!(new.action, Operation::CopyLocal);
    assert!(!fx.l().join("d/a.txt").exists());
    assert!(fx.l().join("d/new.txt").exists());
    assert_eq!(fs::read_to_string(fx.r().join("d/new.txt")).unwrap(), "never synced");
    for side in [fx.l(), fx.r()] {
        let recs = records(&side.join("d"));
        assert!(recs.contains_key("new.txt"));
        assert!(!recs.contains_key("a.txt"));
    }

    let again = fx.sync().await;
    assert_eq!(again.stats.changes(), 0);
    assert_eq!(again.stats.conflicts, 0);
}

#[tokio::test]
async fn unreadable_source_fails_only_that_entry() {
    let fx = Fixture::new();
    write(&fx.l().join("bad.txt"), "unreadable", T0);
    write(&fx.l().join("good1.txt"), "one", T0);
    write(&fx.l().join("good2.txt"), "two", T0);

    let options = SyncOptions {
        dry_run: true,
        ..Default::default()
    };
    let dry = fx
        .synchronizer(UnreadableFile::new(fx.l(), "bad.txt"), options)
        .run()
        .await
        .unwrap();
    let real = fx
        .synchronizer(UnreadableFile::new(fx.l(), "bad.txt"), SyncOptions::default())
        .run()
        .await
        .unwrap();

    assert_eq!(real.errors.len(), 1);
    assert!(real.errors[0].starts_with("/bad.txt:"), "{}", real.errors[0]);
    assert_eq!(dry.errors, real.errors);
    assert!(!dry.is_success());
    assert!(!real.is_success());

    assert!(!fx.r().join("bad.txt").exists());
    assert_eq!(fs::read_to_string(fx.r().join("good1.txt")).unwrap(), "one");
    assert_eq!(fs::read_to_string(fx.r().join("good2.txt")).unwrap(), "two");
    for side in [fx.l(), fx.r()] {
        let recs = records(side);
        assert!(!recs.contains_key("bad.txt"));
        assert!(recs.contains_key("good1.txt"));
        assert!(recs.contains_key("good2.txt"));
    }
}

fn populate(fx: &Fixture) {
    write(&fx.l().join("a.txt"), "a", T0);
    write(&fx.l().join("one/x.txt"), "x", T0 + 1);
    write(&fx.l().join("two/y.txt"), "y", T0 + 2);
    write(&fx.l().join("two/deep/z.txt"), "z", T0 + 3);
    write(&fx.r().join("b.txt"), "b", T0 + 4);
    write(&fx.r().join("three/w.txt"), "w", T0 + 5);
}

#[tokio::test]
async fn interrupted_run_resumes_to_same_result() {
    let interrupted = Fixture::new();
    let baseline = Fixture::new();
    populate(&interrupted);
    populate(&baseline);

    let synchronizer = interrupted.synchronizer(
        Arc::new(LocalTarget::new(interrupted.l())),
        SyncOptions::default(),
    );
    let handle = synchronizer.cancel_handle();
    let synchronizer = synchronizer.with_reporter(Arc::new(CancelAtDir { dir: "two", handle }));
    let report = synchronizer.run().await.unwrap();

    assert!(report.cancelled);
    assert!(interrupted.r().join("one/x.txt").exists());
    assert!(!interrupted.r().join("two/y.txt").exists());
    // 中断前完成的目录已经保存了元数据
    assert!(records(&interrupted.r().join("one")).contains_key("x.txt"));
    assert!(!interrupted.r().join(LOCK_FILE_NAME).exists());

    let resumed = interrupted.sync().await;
    assert!(!resumed.cancelled);
    assert_eq!(resumed.stats.conflicts, 0);
    assert!(resumed.is_success());
    baseline.sync().await;

    assert_eq!(tree(interrupted.l()), tree(baseline.l()));
    assert_eq!(tree(interrupted.r()), tree(baseline.r()));
    assert_eq!(tree(interrupted.l()), tree(interrupted.r()));
    assert_eq!(interrupted.sync().await.stats.changes(), 0);
}
