use crate::config::SyncOptions;
use crate::core::classifier::Classifier;
use crate::core::conflict::{ConflictPrompt, ConflictResolver};
use crate::core::entry::{pair_entries, EntryPair, Side};
use crate::core::filter::EntryFilter;
use crate::core::lock;
use crate::core::metadata::{DirMetadata, MetaRecord};
use crate::core::report::{Decision, NullReporter, Reporter, SyncReport, SyncStats};
use crate::core::resolver::{resolve, Operation};
use crate::error::{SyncError, TargetError};
use crate::storage::{is_reserved_name, same_content, Entry, FileEntry, Target, LOCK_FILE_NAME};
use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// 一个目录在两侧的元数据
struct DirMetas {
    local: DirMetadata,
    remote: DirMetadata,
    /// 目录在这一侧已不存在，元数据借用自另一侧
    absent: Option<Side>,
}

impl DirMetas {
    fn get(&self, side: Side) -> &DirMetadata {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    fn get_mut(&mut self, side: Side) -> &mut DirMetadata {
        match side {
            Side::Local => &mut self.local,
            Side::Remote => &mut self.remote,
        }
    }

    fn set_both(&mut self, name: &str, record: MetaRecord) {
        self.local.set(name, record.clone());
        self.remote.set(name, record);
    }

    fn remove_both(&mut self, name: &str) {
        self.local.remove(name);
        self.remote.remove(name);
    }

    /// 有内容写进了这一侧，目录随之重新存在
    fn arrived(&mut self, side: Side) {
        if self.absent == Some(side) {
            self.absent = None;
        }
    }
}

/// 处理完一个目录后，两侧各自是否还留有条目
#[derive(Debug, Clone, Copy, Default)]
struct Remaining {
    local: bool,
    remote: bool,
}

impl Remaining {
    /// 状态未知时按全部保留处理
    fn all() -> Self {
        Self {
            local: true,
            remote: true,
        }
    }

    fn get(self, side: Side) -> bool {
        match side {
            Side::Local => self.local,
            Side::Remote => self.remote,
        }
    }

    fn mark(&mut self, side: Side) {
        match side {
            Side::Local => self.local = true,
            Side::Remote => self.remote = true,
        }
    }

    /// 条目保持原状
    fn keep(&mut self, pair: &EntryPair) {
        for side in [Side::Local, Side::Remote] {
            if pair.entry(side).is_some() {
                self.mark(side);
            }
        }
    }

    /// 按文件操作的执行结果更新
    fn record(&mut self, pair: &EntryPair, done: bool) {
        if !done {
            return self.keep(pair);
        }
        for side in [Side::Local, Side::Remote] {
            let present = match (pair.operation, side) {
                (Some(Operation::CopyLocal | Operation::CopyRemote), _) => true,
                (Some(Operation::DeleteLocal), Side::Local)
                | (Some(Operation::DeleteRemote), Side::Remote) => false,
                _ => pair.entry(side).is_some(),
            };
            if present {
                self.mark(side);
            }
        }
    }
}

/// 单次运行累积的结果
#[derive(Default)]
struct RunState {
    stats: SyncStats,
    decisions: Vec<Decision>,
    errors: Vec<String>,
    cancelled: bool,
}

/// 同步器
///
/// 深度优先、逐条目顺序地遍历两个目标：列出两侧、按名称配对、过滤、
/// 分类、查表、执行，最后保存目录元数据。先处理文件再进入子目录。
/// 要删除的目录也会先进入处理其中的条目，只有清空后才删除。
pub struct Synchronizer {
    local: Arc<dyn Target>,
    remote: Arc<dyn Target>,
    options: SyncOptions,
    classifier: Classifier,
    filter: EntryFilter,
    conflicts: ConflictResolver,
    reporter: Arc<dyn Reporter>,
    cancelled: Arc<AtomicBool>,
}

impl Synchronizer {
    pub fn new(
        local: Arc<dyn Target>,
        remote: Arc<dyn Target>,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let filter = EntryFilter::new(
            options.match_patterns.as_deref(),
            options.exclude_patterns.as_deref(),
        )?;

        Ok(Self {
            local,
            remote,
            classifier: Classifier::new(options.mtime_tolerance_secs),
            conflicts: ConflictResolver::new(options.conflict_policy),
            filter,
            options,
            reporter: Arc::new(NullReporter),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// `prompt` 策略使用的交互回调
    pub fn with_conflict_prompt(mut self, prompt: Arc<dyn ConflictPrompt>) -> Self {
        self.conflicts = self.conflicts.with_prompt(prompt);
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// 取消标志，可以交给信号处理或其他任务
    ///
    /// 标志只在创建时清零；运行开始前就置位的取消同样生效。
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// 取消同步，在当前条目完成后停止
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn target(&self, side: Side) -> &dyn Target {
        match side {
            Side::Local => self.local.as_ref(),
            Side::Remote => self.remote.as_ref(),
        }
    }

    /// 运行一次同步
    ///
    /// 只有连接失败和启动阶段的错误（根目录、锁、根元数据版本）会返回 Err；
    /// 单个条目的失败记录在报告里。
    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let start = Instant::now();

        info!(
            "开始同步: {} <-> {} (模式: {}, 冲突策略: {}{})",
            self.local.name(),
            self.remote.name(),
            self.options.mode,
            self.conflicts.policy(),
            if self.options.dry_run { ", dry-run" } else { "" }
        );

        self.local.open().await?;
        if let Err(e) = self.remote.open().await {
            let _ = self.local.close().await;
            error!("连接远程目标失败: {}", e);
            return Err(e.into());
        }

        let mut state = RunState::default();
        let result = self.run_locked(&mut state).await;

        for target in [&self.local, &self.remote] {
            if let Err(e) = target.close().await {
                warn!("关闭 {} 失败: {}", target.name(), e);
            }
        }

        if let Err(e) = result {
            error!("同步中止: {}", e);
            return Err(e);
        }

        state.stats.elapsed_ms = start.elapsed().as_millis() as u64;
        let report = SyncReport {
            mode: self.options.mode,
            dry_run: self.options.dry_run,
            cancelled: state.cancelled,
            stats: state.stats,
            decisions: state.decisions,
            errors: state.errors,
        };
        self.reporter.on_finish(&report);
        Ok(report)
    }

    async fn run_locked(&self, state: &mut RunState) -> Result<(), SyncError> {
        // dry-run 复用目标的只读模式，结束后恢复原状态
        let readonly = (self.local.readonly(), self.remote.readonly());
        if self.options.dry_run {
            self.local.set_readonly(true);
            self.remote.set_readonly(true);
        }
        let _restore = scopeguard::guard(readonly, |(local, remote)| {
            self.local.set_readonly(local);
            self.remote.set_readonly(remote);
        });

        self.check_roots().await?;

        // 任何修改之前先确认没有其他运行，并确认根元数据版本可用
        lock::check(self.local.as_ref(), "").await?;
        lock::check(self.remote.as_ref(), "").await?;
        let metas = self.load_metas("").await?;

        lock::acquire(self.local.as_ref(), "").await?;
        if let Err(e) = lock::acquire(self.remote.as_ref(), "").await {
            let _ = lock::release(self.local.as_ref(), "").await;
            return Err(e);
        }

        let result = self.sync_dir(String::new(), Some(metas), state).await;

        for target in [&self.local, &self.remote] {
            if let Err(e) = lock::release(target.as_ref(), "").await {
                warn!("释放锁失败 {}: {}", target.name(), e);
            }
        }
        result.map(|_| ())
    }

    async fn check_roots(&self) -> Result<(), SyncError> {
        if !self.local.root_exists().await? {
            return Err(SyncError::RootMissing(self.local.name().to_string()));
        }
        if !self.remote.root_exists().await? {
            if !self.options.create_folders {
                return Err(SyncError::RootMissing(self.remote.name().to_string()));
            }
            info!("创建远程根目录: {}", self.remote.name());
            self.remote.mkdir("").await?;
        }
        Ok(())
    }

    async fn load_metas(&self, dir: &str) -> Result<DirMetas, SyncError> {
        Ok(DirMetas {
            local: DirMetadata::load(self.local.as_ref(), dir, self.options.migrate).await?,
            remote: DirMetadata::load(self.remote.as_ref(), dir, self.options.migrate).await?,
            absent: None,
        })
    }

    /// 目录只剩 `present` 一侧时，另一侧的同步历史取自 `present` 的元数据，
    /// 这样被删掉的一侧的子条目能分类为 deleted
    async fn load_metas_from(&self, dir: &str, present: Side) -> Result<DirMetas, SyncError> {
        let meta = DirMetadata::load(self.target(present), dir, self.options.migrate).await?;
        let borrowed = meta.clone();
        Ok(match present {
            Side::Local => DirMetas {
                local: meta,
                remote: borrowed,
                absent: Some(Side::Remote),
            },
            Side::Remote => DirMetas {
                local: borrowed,
                remote: meta,
                absent: Some(Side::Local),
            },
        })
    }

    /// 同步一个目录（递归），返回处理后两侧是否还有条目
    fn sync_dir<'a>(
        &'a self,
        dir: String,
        preloaded: Option<DirMetas>,
        state: &'a mut RunState,
    ) -> BoxFuture<'a, Result<Remaining, SyncError>> {
        async move {
            self.reporter.on_dir(&dir);
            state.stats.dirs_visited += 1;
            debug!("同步目录: /{}", dir);

            let (local_entries, remote_entries) = match self.list_both(&dir).await {
                Ok(lists) => lists,
                Err(e) => {
                    self.triage(state, &dir, e)?;
                    return Ok(Remaining::all());
                }
            };

            // 子目录里的锁文件表示另一个同步正在处理这棵子树
            if !dir.is_empty() {
                let sides = [
                    (self.local.as_ref(), &local_entries),
                    (self.remote.as_ref(), &remote_entries),
                ];
                for (target, entries) in sides {
                    if entries.iter().any(|e| e.name() == LOCK_FILE_NAME) {
                        if let Err(e) = lock::check(target, &dir).await {
                            self.triage(state, &dir, e)?;
                            return Ok(Remaining::all());
                        }
                    }
                }
            }

            let mut metas = match preloaded {
                Some(metas) => metas,
                None => match self.load_metas(&dir).await {
                    Ok(metas) => metas,
                    Err(e) => {
                        self.triage(state, &dir, e)?;
                        return Ok(Remaining::all());
                    }
                },
            };

            let mut remaining = Remaining::default();
            let mut files = Vec::new();
            let mut dirs = Vec::new();
            for pair in pair_entries(&dir, local_entries, remote_entries) {
                if is_reserved_name(&pair.name) {
                    continue;
                }
                if !self.accepts(&pair) {
                    debug!("排除: {}", pair.rel_path);
                    state.stats.entries_excluded += 1;
                    remaining.keep(&pair);
                    continue;
                }
                if pair.is_dir() && !pair.is_type_mismatch() {
                    dirs.push(pair);
                } else {
                    files.push(pair);
                }
            }

            for mut pair in files {
                if self.is_cancelled() {
                    state.cancelled = true;
                    break;
                }
                let done = match self.sync_file(&mut pair, &mut metas, state).await {
                    Ok(()) => true,
                    Err(e) => {
                        self.triage(state, &pair.rel_path, e)?;
                        false
                    }
                };
                remaining.record(&pair, done);
            }

            // 进入子目录之前先保存本层文件的结果
            self.flush_metas(&mut metas, state).await?;

            let mut deferred = Vec::new();
            for mut pair in dirs {
                if state.cancelled || self.is_cancelled() {
                    state.cancelled = true;
                    break;
                }

                let resolved = self.classify_pair(&mut pair, &metas);
                let compared = match resolved {
                    // 两侧都是目录时只需递归比较内容
                    Operation::NeedCompare if pair.local.is_some() && pair.remote.is_some() => {
                        Operation::Equal
                    }
                    Operation::NeedCompare => Operation::Conflict,
                    op => op,
                };

                match self.settle(&mut pair, resolved, compared, state) {
                    op @ (Operation::Equal | Operation::CopyLocal | Operation::CopyRemote) => {
                        match self.prepare_dir(&pair, op, state).await {
                            Ok(created) => {
                                if let Some(side) = created {
                                    metas.arrived(side);
                                }
                                metas.set_both(&pair.name, MetaRecord::for_dir());
                                self.sync_dir(pair.rel_path.clone(), None, &mut *state)
                                    .await?;
                                remaining.mark(Side::Local);
                                remaining.mark(Side::Remote);
                            }
                            Err(e) => {
                                self.triage(state, &pair.rel_path, e)?;
                                remaining.keep(&pair);
                            }
                        }
                    }
                    op @ (Operation::DeleteLocal | Operation::DeleteRemote) => {
                        let side = if op == Operation::DeleteLocal {
                            Side::Local
                        } else {
                            Side::Remote
                        };
                        let inner = self.sync_doomed_dir(&pair, side, state).await?;
                        if inner.get(side) {
                            // 子树里还有要保留的内容，目录不能删
                            debug!("保留目录 {}: 仍有未同步的条目", pair.rel_path);
                            remaining.mark(side);
                            if inner.get(side.other()) {
                                metas.arrived(side.other());
                                metas.set_both(&pair.name, MetaRecord::for_dir());
                                remaining.mark(side.other());
                            }
                        } else {
                            deferred.push((pair, op));
                        }
                    }
                    Operation::Noop => {
                        metas.remove_both(&pair.name);
                        state.stats.noop += 1;
                    }
                    Operation::Disallowed => {
                        state.stats.skipped += 1;
                        remaining.keep(&pair);
                    }
                    Operation::Conflict | Operation::NeedCompare => remaining.keep(&pair),
                }
            }

            // 已清空的目录在同层遍历之后删除
            for (pair, op) in deferred {
                if state.cancelled || self.is_cancelled() {
                    state.cancelled = true;
                    break;
                }
                if let Err(e) = self.delete_entry(&pair, op, &mut metas, state).await {
                    self.triage(state, &pair.rel_path, e)?;
                    remaining.keep(&pair);
                }
            }

            self.flush_metas(&mut metas, state).await?;
            Ok(if state.cancelled {
                Remaining::all()
            } else {
                remaining
            })
        }
        .boxed()
    }

    /// 处理将被删除的目录中的条目：另一侧已删除的按 deleted 处理，
    /// 修改过的和新增的照常分类
    async fn sync_doomed_dir(
        &self,
        pair: &EntryPair,
        side: Side,
        state: &mut RunState,
    ) -> Result<Remaining, SyncError> {
        let metas = if pair.entry(side.other()).is_some() {
            self.load_metas(&pair.rel_path).await
        } else {
            self.load_metas_from(&pair.rel_path, side).await
        };
        match metas {
            Ok(metas) => self.sync_dir(pair.rel_path.clone(), Some(metas), state).await,
            Err(e) => {
                self.triage(state, &pair.rel_path, e)?;
                Ok(Remaining::all())
            }
        }
    }

    async fn list_both(&self, dir: &str) -> Result<(Vec<Entry>, Vec<Entry>), SyncError> {
        let local = self.local.list_dir(dir).await?;
        let remote = self.remote.list_dir(dir).await?;
        Ok((local, remote))
    }

    /// 任意一侧被过滤掉，整个条目对就不参与同步
    fn accepts(&self, pair: &EntryPair) -> bool {
        pair.local
            .iter()
            .chain(pair.remote.iter())
            .all(|entry| self.filter.accepts(entry))
    }

    /// 分类两侧并查表
    fn classify_pair(&self, pair: &mut EntryPair, metas: &DirMetas) -> Operation {
        for side in [Side::Local, Side::Remote] {
            let meta = metas.get(side);
            let class = self.classifier.classify(
                pair.entry(side),
                meta.get(&pair.name),
                meta.existed(),
                side,
            );
            match side {
                Side::Local => pair.local_class = Some(class),
                Side::Remote => pair.remote_class = Some(class),
            }
        }
        let (local, remote) = pair.classification();
        resolve(local, remote)
    }

    /// 应用模式限制和冲突策略，记录决策
    fn settle(
        &self,
        pair: &mut EntryPair,
        resolved: Operation,
        compared: Operation,
        state: &mut RunState,
    ) -> Operation {
        let mut op = self
            .options
            .mode
            .restrict(compared, pair, self.options.delete_unmatched);

        // 文件和目录互换的条目没有安全的自动处理方式
        if pair.is_type_mismatch() {
            op = Operation::Conflict;
        }

        if op == Operation::Conflict {
            state.stats.conflicts += 1;
            if !pair.is_type_mismatch() {
                op = self.conflicts.resolve(pair);
                if !self.options.mode.permits(op) {
                    op = Operation::Conflict;
                }
            }
            if op != Operation::Conflict {
                state.stats.conflicts_resolved += 1;
            }
        }

        pair.operation = Some(op);
        let (local, remote) = pair.classification();
        let decision = Decision {
            path: pair.rel_path.clone(),
            dir: pair.is_dir(),
            local,
            remote,
            operation: resolved,
            action: op,
        };
        self.reporter.on_decision(&decision);
        state.decisions.push(decision);
        op
    }

    async fn sync_file(
        &self,
        pair: &mut EntryPair,
        metas: &mut DirMetas,
        state: &mut RunState,
    ) -> Result<(), SyncError> {
        let resolved = self.classify_pair(pair, metas);
        let compared = if resolved == Operation::NeedCompare {
            self.compare(pair, state).await?
        } else {
            resolved
        };
        let op = self.settle(pair, resolved, compared, state);

        match op {
            Operation::Equal => {
                if let (Some(Entry::File(l)), Some(Entry::File(r))) = (&pair.local, &pair.remote) {
                    metas.set_both(&pair.name, MetaRecord::for_files(l, r, Side::Local));
                }
                state.stats.equal += 1;
            }
            Operation::CopyLocal => self.copy_file(pair, Side::Local, metas, state).await?,
            Operation::CopyRemote => self.copy_file(pair, Side::Remote, metas, state).await?,
            Operation::DeleteLocal | Operation::DeleteRemote => {
                self.delete_entry(pair, op, metas, state).await?
            }
            Operation::Noop => {
                metas.remove_both(&pair.name);
                state.stats.noop += 1;
            }
            Operation::Disallowed => state.stats.skipped += 1,
            Operation::Conflict | Operation::NeedCompare => {}
        }
        Ok(())
    }

    /// 分类无法判断时比较内容：大小不同或字节不同即为冲突
    async fn compare(&self, pair: &EntryPair, state: &mut RunState) -> Result<Operation, SyncError> {
        let (Some(Entry::File(local)), Some(Entry::File(remote))) = (&pair.local, &pair.remote)
        else {
            // 只有一侧存在，或者类型不同
            return Ok(Operation::Conflict);
        };

        state.stats.files_compared += 1;
        if local.size != remote.size {
            return Ok(Operation::Conflict);
        }

        let local_data = self.local.read_stream(&pair.rel_path).await?;
        let remote_data = self.remote.read_stream(&pair.rel_path).await?;
        let op = if same_content(local_data, remote_data).await? {
            Operation::Equal
        } else {
            Operation::Conflict
        };
        debug!("比较内容 {}: {}", pair.rel_path, op);
        Ok(op)
    }

    /// 从 `from` 一侧复制文件到另一侧，并在两侧记录同步状态
    async fn copy_file(
        &self,
        pair: &EntryPair,
        from: Side,
        metas: &mut DirMetas,
        state: &mut RunState,
    ) -> Result<(), SyncError> {
        let Some(Entry::File(src)) = pair.entry(from) else {
            return Err(TargetError::Unsupported(format!("{} 不是文件", pair.rel_path)).into());
        };
        let source = self.target(from);
        let dest = self.target(from.other());

        let bytes = if self.options.dry_run {
            // 不写目标，但源文件读不了的错误要和实际运行一样报出来
            let mut stream = source.read_stream(&pair.rel_path).await?;
            stream.try_next().await?;
            src.size
        } else {
            let stream = source.read_stream(&pair.rel_path).await?;
            dest.write_stream(&pair.rel_path, stream).await?
        };
        metas.arrived(from.other());

        if !dest.set_mtime(&pair.rel_path, src.mtime).await? {
            debug!("{} 不支持设置修改时间: {}", dest.name(), pair.rel_path);
        }

        // 以写入后目标侧的实际状态为准，后端可能截断或忽略时间
        let written = if self.options.dry_run {
            src.clone()
        } else {
            match dest.stat(&pair.rel_path).await? {
                Some(Entry::File(f)) => f,
                _ => {
                    return Err(TargetError::io(
                        &pair.rel_path,
                        std::io::Error::new(std::io::ErrorKind::NotFound, "写入后找不到文件"),
                    )
                    .into())
                }
            }
        };

        let (local, remote): (&FileEntry, &FileEntry) = match from {
            Side::Local => (src, &written),
            Side::Remote => (&written, src),
        };
        metas.set_both(&pair.name, MetaRecord::for_files(local, remote, from));

        match from {
            Side::Local => state.stats.copied_local += 1,
            Side::Remote => state.stats.copied_remote += 1,
        }
        state.stats.bytes_written += bytes;
        debug!("复制 {} -> {}: {} ({} 字节)", source.name(), dest.name(), pair.rel_path, bytes);
        Ok(())
    }

    async fn delete_entry(
        &self,
        pair: &EntryPair,
        op: Operation,
        metas: &mut DirMetas,
        state: &mut RunState,
    ) -> Result<(), SyncError> {
        let side = if op == Operation::DeleteLocal {
            Side::Local
        } else {
            Side::Remote
        };
        let target = self.target(side);

        match pair.entry(side) {
            Some(Entry::Dir(_)) => target.remove_dir(&pair.rel_path).await?,
            Some(Entry::File(_)) => target.remove_file(&pair.rel_path).await?,
            None => {}
        }
        metas.remove_both(&pair.name);

        match side {
            Side::Local => state.stats.deleted_local += 1,
            Side::Remote => state.stats.deleted_remote += 1,
        }
        debug!("删除 {}: {}", target.name(), pair.rel_path);
        Ok(())
    }

    /// 复制目录时在缺失的一侧创建，返回创建的一侧
    async fn prepare_dir(
        &self,
        pair: &EntryPair,
        op: Operation,
        state: &mut RunState,
    ) -> Result<Option<Side>, SyncError> {
        let missing = match op {
            Operation::CopyLocal if pair.remote.is_none() => Side::Remote,
            Operation::CopyRemote if pair.local.is_none() => Side::Local,
            _ => return Ok(None),
        };
        self.target(missing).mkdir(&pair.rel_path).await?;
        state.stats.dirs_created += 1;
        Ok(Some(missing))
    }

    async fn flush_metas(&self, metas: &mut DirMetas, state: &mut RunState) -> Result<(), SyncError> {
        if self.options.dry_run {
            return Ok(());
        }
        for side in [Side::Local, Side::Remote] {
            // 目录在这一侧不存在，不为元数据重新创建它
            if metas.absent == Some(side) {
                continue;
            }
            if let Err(e) = metas.get_mut(side).flush(self.target(side)).await {
                let path = metas.get(side).file_path();
                self.triage(state, &path, e)?;
            }
        }
        Ok(())
    }

    /// 连接错误中止运行，其余错误记录后继续
    fn triage(&self, state: &mut RunState, path: &str, err: SyncError) -> Result<(), SyncError> {
        if err.is_connectivity() {
            error!("连接失败，中止同步: {}", err);
            return Err(err);
        }

        let message = err.to_string();
        self.reporter.on_error(path, &message);
        state.stats.errors += 1;
        state.errors.push(format!("/{}: {}", path, message));
        Ok(())
    }
}
