// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! File Sync Engine.
//!
//! Trees are enumerated lazily and transferred one file at a time. Each file is written
//! under a temporary sibling name, stamped with the source modification time, then renamed
//! into place. Conflict policy is evaluated per file before any byte moves.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::services::random::{generate_handle, random_suffix};
use crate::app::services::sessions::{RemoteSession, SessionManager};
use crate::app::services::shell::{join_remote, split_remote};
use crate::app::services::walk::{
    LocalWalker, PARTIAL_MARKER, PARTIAL_SUFFIX, PathFilter, RemoteWalker, WalkEntry,
    compare_rel, local_error, local_meta,
};
use crate::app::types::{
    ConflictPolicy, DivergenceKind, DivergentEntry, EntryMeta, SyncDirection, SyncFilterRule,
    SyncProgress, SyncReport,
};

const COPY_BUFFER: usize = 64 * 1024;

/// Handle and cancel token for one push or pull.
#[derive(Debug, Clone)]
pub struct SyncTask {
    handle: String,
    cancelled: Arc<AtomicBool>,
}

impl SyncTask {
    pub fn new() -> Self {
        Self {
            handle: generate_handle("sync"),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// The file in flight finishes; nothing after it is started.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for SyncTask {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub policy: ConflictPolicy,
    pub filters: Vec<SyncFilterRule>,
}

impl SyncOptions {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            filters: Vec::new(),
        }
    }

    pub fn with_filters(mut self, filters: Vec<SyncFilterRule>) -> Self {
        self.filters = filters;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Transfer,
    Skip,
    Diverged,
}

fn decide(policy: ConflictPolicy, src: &EntryMeta, dst: Option<&EntryMeta>) -> Decision {
    let Some(dst) = dst else {
        return Decision::Transfer;
    };
    let identical = dst.size == src.size && dst.mtime == src.mtime;
    match policy {
        ConflictPolicy::Overwrite => Decision::Transfer,
        ConflictPolicy::SkipIfNewer if identical || dst.mtime > src.mtime => Decision::Skip,
        ConflictPolicy::SkipIfNewer => Decision::Transfer,
        ConflictPolicy::FailOnConflict if identical => Decision::Skip,
        ConflictPolicy::FailOnConflict => Decision::Diverged,
    }
}

fn classify(local: &EntryMeta, remote: &EntryMeta) -> Option<DivergenceKind> {
    if local.is_dir != remote.is_dir {
        return Some(DivergenceKind::TypeMismatch);
    }
    if local.is_dir {
        return None;
    }
    if local.size != remote.size {
        return Some(DivergenceKind::SizeDiffers);
    }
    match local.mtime.cmp(&remote.mtime) {
        std::cmp::Ordering::Greater => Some(DivergenceKind::LocalNewer),
        std::cmp::Ordering::Less => Some(DivergenceKind::RemoteNewer),
        std::cmp::Ordering::Equal => None,
    }
}

fn partial_name(name: &str) -> String {
    format!(".{name}{PARTIAL_MARKER}{}{PARTIAL_SUFFIX}", random_suffix())
}

fn remote_stream_error(err: std::io::Error, path: &str) -> AppError {
    AppError::with_message(AppErrorKind::TransportError, codes::REMOTE_ERROR, err.to_string())
        .with_context(path.to_string())
}

enum PumpError {
    Read(std::io::Error),
    Write(std::io::Error),
}

async fn pump<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, PumpError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(PumpError::Read)?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(PumpError::Write)?;
        total += n as u64;
    }
    writer.shutdown().await.map_err(PumpError::Write)?;
    Ok(total)
}

async fn local_stat(path: &Path) -> AppResult<Option<EntryMeta>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(local_meta(&meta))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(local_error(err, path)),
    }
}

fn local_join(root: &Path, rel: &str) -> PathBuf {
    if rel.is_empty() {
        return root.to_path_buf();
    }
    rel.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Lazily produced entries of one side of a sync.
enum Source<'a> {
    Empty,
    Single(Option<WalkEntry>),
    Local(LocalWalker),
    Remote(RemoteWalker<'a>),
}

impl Source<'_> {
    fn single(meta: EntryMeta) -> Self {
        Source::Single(Some(WalkEntry {
            rel: String::new(),
            meta,
        }))
    }

    async fn next(&mut self) -> AppResult<Option<WalkEntry>> {
        match self {
            Source::Empty => Ok(None),
            Source::Single(entry) => Ok(entry.take()),
            Source::Local(walker) => Ok(walker.next()),
            Source::Remote(walker) => walker.next().await,
        }
    }

    /// Files not yet yielded. Enumeration errors end the list early.
    async fn remaining_files(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        loop {
            match self.next().await {
                Ok(Some(entry)) if !entry.meta.is_dir => out.push(entry.rel),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(error = %err, "stopped listing untouched files");
                    break;
                }
            }
        }
        out
    }
}

/// Bookkeeping for one running task.
struct Run<'t> {
    task: &'t SyncTask,
    direction: SyncDirection,
    root_label: String,
    completed: Vec<String>,
    transferred: Vec<String>,
    skipped: Vec<String>,
    directories_created: usize,
}

impl<'t> Run<'t> {
    fn new(task: &'t SyncTask, direction: SyncDirection, root_label: String) -> Self {
        Self {
            task,
            direction,
            root_label,
            completed: Vec::new(),
            transferred: Vec::new(),
            skipped: Vec::new(),
            directories_created: 0,
        }
    }

    fn label(&self, rel: &str) -> String {
        if rel.is_empty() {
            self.root_label.clone()
        } else {
            rel.to_string()
        }
    }

    fn transferred(&mut self, rel: &str) {
        let label = self.label(rel);
        self.completed.push(label.clone());
        self.transferred.push(label);
    }

    fn skipped(&mut self, rel: &str) {
        let label = self.label(rel);
        self.completed.push(label.clone());
        self.skipped.push(label);
    }

    /// Attaches progress to `err`. `untouched` is the entry already taken from `source`
    /// that was not finished; it heads the not-attempted list.
    async fn stop(
        &self,
        err: AppError,
        failed: Option<&str>,
        untouched: Option<&str>,
        source: &mut Source<'_>,
    ) -> AppError {
        let mut not_attempted: Vec<String> =
            untouched.map(|rel| self.label(rel)).into_iter().collect();
        if !err.kind().is_transient() {
            not_attempted.extend(source.remaining_files().await);
        }
        tracing::warn!(
            task = %self.task.handle(),
            code = err.code(),
            failed = failed.map(|rel| self.label(rel)).as_deref().unwrap_or("-"),
            completed = self.completed.len(),
            "sync stopped"
        );
        err.with_sync_progress(SyncProgress {
            task: self.task.handle().to_string(),
            failed_path: failed.map(|rel| self.label(rel)),
            completed: self.completed.clone(),
            not_attempted,
        })
    }

    fn report(self) -> SyncReport {
        SyncReport {
            task: self.task.handle().to_string(),
            direction: self.direction,
            transferred: self.transferred,
            skipped: self.skipped,
            directories_created: self.directories_created,
        }
    }
}

fn type_conflict(label: &str, dst_is_dir: bool) -> AppError {
    let (src, dst) = if dst_is_dir {
        ("file", "directory")
    } else {
        ("directory", "file")
    };
    AppError::of(
        AppErrorKind::SyncConflict,
        format!("source is a {src} but destination is a {dst}"),
    )
    .with_context(label.to_string())
}

fn diverged(label: &str) -> AppError {
    AppError::of(
        AppErrorKind::SyncAborted,
        "destination differs from source under fail-on-conflict",
    )
    .with_context(label.to_string())
}

fn cancelled() -> AppError {
    AppError::of(AppErrorKind::Cancelled, "sync cancelled")
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub struct FileSyncEngine {
    sessions: Arc<SessionManager>,
}

impl FileSyncEngine {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    pub async fn push(
        &self,
        session: &RemoteSession,
        local_path: &Path,
        remote_path: &str,
        policy: ConflictPolicy,
    ) -> AppResult<SyncReport> {
        self.push_with(
            &SyncTask::new(),
            session,
            local_path,
            remote_path,
            &SyncOptions::new(policy),
        )
        .await
    }

    pub async fn pull(
        &self,
        session: &RemoteSession,
        remote_path: &str,
        local_path: &Path,
        policy: ConflictPolicy,
    ) -> AppResult<SyncReport> {
        self.pull_with(
            &SyncTask::new(),
            session,
            remote_path,
            local_path,
            &SyncOptions::new(policy),
        )
        .await
    }

    #[tracing::instrument(
        name = "sync",
        level = "debug",
        skip(self, task, session, options),
        fields(op = "push", task = %task.handle(), host = %session.config().host)
    )]
    pub async fn push_with(
        &self,
        task: &SyncTask,
        session: &RemoteSession,
        local_path: &Path,
        remote_path: &str,
        options: &SyncOptions,
    ) -> AppResult<SyncReport> {
        let handle = task.handle().to_string();
        let filter =
            Arc::new(PathFilter::new(&options.filters).map_err(|e| e.with_handle(&handle))?);
        let remote_root = session.resolve_path(remote_path);
        let root_meta = local_stat(local_path)
            .await
            .map_err(|e| e.with_handle(&handle))?
            .ok_or_else(|| {
                AppError::of(AppErrorKind::NotFound, "local path does not exist")
                    .with_context(local_path.display().to_string())
                    .with_handle(&handle)
            })?;

        tracing::info!(
            task = %handle,
            local = %local_path.display(),
            remote = %remote_root,
            policy = ?options.policy,
            "push started"
        );
        let mut run = Run::new(task, SyncDirection::Push, file_name_of(local_path));
        let mut source = if root_meta.is_dir {
            Source::Local(LocalWalker::new(local_path, filter))
        } else {
            Source::single(root_meta)
        };

        let root_result = if root_meta.is_dir {
            self.ensure_remote_dir(session, &remote_root, &mut run, true)
                .await
        } else {
            let (parent, _) = split_remote(&remote_root);
            self.ensure_remote_dir(session, parent, &mut run, true).await
        };
        if let Err(err) = root_result {
            return Err(run.stop(err, None, None, &mut source).await);
        }

        loop {
            let entry = match source.next().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => return Err(run.stop(err, None, None, &mut source).await),
            };
            let dst = join_remote(&remote_root, &entry.rel);
            if entry.meta.is_dir {
                if let Err(err) = self
                    .ensure_remote_dir(session, &dst, &mut run, false)
                    .await
                {
                    let rel = Some(entry.rel.as_str());
                    return Err(run.stop(err, rel, rel, &mut source).await);
                }
                continue;
            }
            if task.is_cancelled() {
                return Err(run
                    .stop(cancelled(), None, Some(&entry.rel), &mut source)
                    .await);
            }
            let src = local_join(local_path, &entry.rel);
            match self.push_file(session, &src, &dst, &entry, options.policy, &run).await {
                Ok(true) => run.transferred(&entry.rel),
                Ok(false) => run.skipped(&entry.rel),
                Err(err) => {
                    let rel = Some(entry.rel.as_str());
                    return Err(run.stop(err, rel, rel, &mut source).await);
                }
            }
        }

        let report = run.report();
        tracing::info!(
            task = %handle,
            transferred = report.transferred.len(),
            skipped = report.skipped.len(),
            "push finished"
        );
        Ok(report)
    }

    #[tracing::instrument(
        name = "sync",
        level = "debug",
        skip(self, task, session, options),
        fields(op = "pull", task = %task.handle(), host = %session.config().host)
    )]
    pub async fn pull_with(
        &self,
        task: &SyncTask,
        session: &RemoteSession,
        remote_path: &str,
        local_path: &Path,
        options: &SyncOptions,
    ) -> AppResult<SyncReport> {
        let handle = task.handle().to_string();
        let filter =
            Arc::new(PathFilter::new(&options.filters).map_err(|e| e.with_handle(&handle))?);
        let remote_root = session.resolve_path(remote_path);
        let root_meta = self
            .remote_stat(session, &remote_root)
            .await
            .map_err(|e| e.with_handle(&handle))?
            .ok_or_else(|| {
                AppError::of(AppErrorKind::NotFound, "remote path does not exist")
                    .with_context(remote_root.clone())
                    .with_handle(&handle)
            })?;

        tracing::info!(
            task = %handle,
            remote = %remote_root,
            local = %local_path.display(),
            policy = ?options.policy,
            "pull started"
        );
        let (_, root_name) = split_remote(&remote_root);
        let mut run = Run::new(task, SyncDirection::Pull, root_name.to_string());
        let mut source = if root_meta.is_dir {
            Source::Remote(RemoteWalker::new(
                &self.sessions,
                session,
                remote_root.clone(),
                filter,
            ))
        } else {
            Source::single(root_meta)
        };

        let root_dir = if root_meta.is_dir {
            Some(local_path)
        } else {
            local_path.parent()
        };
        if let Some(dir) = root_dir
            && !dir.as_os_str().is_empty()
            && let Err(err) = ensure_local_dir(dir, &mut run, true).await
        {
            return Err(run.stop(err, None, None, &mut source).await);
        }

        loop {
            let entry = match source.next().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => return Err(run.stop(err, None, None, &mut source).await),
            };
            let dst = local_join(local_path, &entry.rel);
            if entry.meta.is_dir {
                if let Err(err) = ensure_local_dir(&dst, &mut run, false).await {
                    let rel = Some(entry.rel.as_str());
                    return Err(run.stop(err, rel, rel, &mut source).await);
                }
                continue;
            }
            if task.is_cancelled() {
                return Err(run
                    .stop(cancelled(), None, Some(&entry.rel), &mut source)
                    .await);
            }
            let src = join_remote(&remote_root, &entry.rel);
            match self.pull_file(session, &src, &dst, &entry, options.policy, &run).await {
                Ok(true) => run.transferred(&entry.rel),
                Ok(false) => run.skipped(&entry.rel),
                Err(err) => {
                    let rel = Some(entry.rel.as_str());
                    return Err(run.stop(err, rel, rel, &mut source).await);
                }
            }
        }

        let report = run.report();
        tracing::info!(
            task = %handle,
            transferred = report.transferred.len(),
            skipped = report.skipped.len(),
            "pull finished"
        );
        Ok(report)
    }

    /// Lists every path whose local and remote entries differ. Identical files and
    /// directories present on both sides are omitted.
    #[tracing::instrument(
        name = "sync",
        level = "debug",
        skip(self, session, filters),
        fields(op = "diff", host = %session.config().host)
    )]
    pub async fn diff(
        &self,
        session: &RemoteSession,
        local_path: &Path,
        remote_path: &str,
        filters: &[SyncFilterRule],
    ) -> AppResult<Vec<DivergentEntry>> {
        let filter = Arc::new(PathFilter::new(filters)?);
        let remote_root = session.resolve_path(remote_path);
        let local_root = local_stat(local_path).await?;
        let remote_root_meta = self.remote_stat(session, &remote_root).await?;

        let root_label = file_name_of(local_path);
        let root_entry = |local: Option<EntryMeta>, remote: Option<EntryMeta>, kind| DivergentEntry {
            path: root_label.clone(),
            kind,
            local,
            remote,
        };
        match (local_root, remote_root_meta) {
            (None, None) => {
                return Err(AppError::of(
                    AppErrorKind::NotFound,
                    "neither side of the comparison exists",
                )
                .with_context(format!("{} <-> {remote_root}", local_path.display())));
            }
            (Some(l), Some(r)) if l.is_dir != r.is_dir => {
                return Ok(vec![root_entry(Some(l), Some(r), DivergenceKind::TypeMismatch)]);
            }
            (Some(l), None) if !l.is_dir => {
                return Ok(vec![root_entry(Some(l), None, DivergenceKind::LocalOnly)]);
            }
            (None, Some(r)) if !r.is_dir => {
                return Ok(vec![root_entry(None, Some(r), DivergenceKind::RemoteOnly)]);
            }
            (Some(l), Some(r)) if !l.is_dir => {
                return Ok(classify(&l, &r)
                    .map(|kind| root_entry(Some(l), Some(r), kind))
                    .into_iter()
                    .collect());
            }
            _ => {}
        }

        let mut local = match local_root {
            Some(_) => Source::Local(LocalWalker::new(local_path, filter.clone())),
            None => Source::Empty,
        };
        let mut remote = match remote_root_meta {
            Some(_) => Source::Remote(RemoteWalker::new(
                &self.sessions,
                session,
                remote_root.clone(),
                filter,
            )),
            None => Source::Empty,
        };

        let mut out = Vec::new();
        let mut l = local.next().await?;
        let mut r = remote.next().await?;
        loop {
            match (l.take(), r.take()) {
                (None, None) => break,
                (Some(le), None) => {
                    out.push(only(le, DivergenceKind::LocalOnly));
                    l = local.next().await?;
                }
                (None, Some(re)) => {
                    out.push(only(re, DivergenceKind::RemoteOnly));
                    r = remote.next().await?;
                }
                (Some(le), Some(re)) => match compare_rel(&le.rel, &re.rel) {
                    std::cmp::Ordering::Less => {
                        out.push(only(le, DivergenceKind::LocalOnly));
                        l = local.next().await?;
                        r = Some(re);
                    }
                    std::cmp::Ordering::Greater => {
                        out.push(only(re, DivergenceKind::RemoteOnly));
                        r = remote.next().await?;
                        l = Some(le);
                    }
                    std::cmp::Ordering::Equal => {
                        if let Some(kind) = classify(&le.meta, &re.meta) {
                            out.push(DivergentEntry {
                                path: le.rel,
                                kind,
                                local: Some(le.meta),
                                remote: Some(re.meta),
                            });
                        }
                        l = local.next().await?;
                        r = remote.next().await?;
                    }
                },
            }
        }
        tracing::debug!(divergent = out.len(), "diff finished");
        Ok(out)
    }

    async fn remote_stat(&self, session: &RemoteSession, path: &str) -> AppResult<Option<EntryMeta>> {
        let mut lease = self.sessions.lease(session).await?;
        lease.stat(path).await
    }

    /// Creates `path` and any missing ancestors. A file in the way is a conflict.
    async fn ensure_remote_dir(
        &self,
        session: &RemoteSession,
        path: &str,
        run: &mut Run<'_>,
        with_parents: bool,
    ) -> AppResult<()> {
        if path.is_empty() || path == "/" || path == "~" {
            return Ok(());
        }
        let mut lease = self.sessions.lease(session).await?;
        let mut missing = Vec::new();
        let mut current = path.to_string();
        loop {
            match lease.stat(&current).await? {
                Some(meta) if meta.is_dir => break,
                Some(_) => return Err(type_conflict(&run.label(""), false).with_context(current)),
                None => {
                    missing.push(current.clone());
                    if !with_parents {
                        break;
                    }
                    let (parent, _) = split_remote(&current);
                    if parent.is_empty() || parent == "/" || parent == "~" {
                        break;
                    }
                    current = parent.to_string();
                }
            }
        }
        for dir in missing.iter().rev() {
            lease.create_dir(dir).await?;
            run.directories_created += 1;
            tracing::debug!(dir = %dir, "created remote directory");
        }
        Ok(())
    }

    /// Returns whether the file was transferred (`false` means skipped by policy).
    async fn push_file(
        &self,
        session: &RemoteSession,
        src: &Path,
        dst: &str,
        entry: &WalkEntry,
        policy: ConflictPolicy,
        run: &Run<'_>,
    ) -> AppResult<bool> {
        let label = run.label(&entry.rel);
        let mut lease = self.sessions.lease(session).await?;
        let existing = lease.stat(dst).await?;
        if existing.is_some_and(|meta| meta.is_dir) {
            return Err(type_conflict(&label, true));
        }
        match decide(policy, &entry.meta, existing.as_ref()) {
            Decision::Skip => {
                tracing::debug!(path = %label, "skipped");
                return Ok(false);
            }
            Decision::Diverged => return Err(diverged(&label)),
            Decision::Transfer => {}
        }

        let mut file = tokio::fs::File::open(src)
            .await
            .map_err(|e| local_error(e, src))?;
        let (parent, name) = split_remote(dst);
        let tmp = join_remote(parent, &partial_name(name));
        let mut writer = lease.open_write(&tmp).await?;
        let pumped = pump(&mut file, &mut writer).await;
        drop(writer);
        let bytes = match pumped {
            Ok(bytes) => bytes,
            Err(failure) => {
                let _ = lease.remove_file(&tmp).await;
                return Err(match failure {
                    PumpError::Read(err) => local_error(err, src),
                    PumpError::Write(err) => {
                        lease.mark_failed("remote write stream failed").await;
                        remote_stream_error(err, dst)
                    }
                });
            }
        };
        let finished = async {
            lease.set_mtime(&tmp, entry.meta.mtime).await?;
            lease.rename(&tmp, dst).await
        }
        .await;
        if let Err(err) = finished {
            if !err.kind().is_transient() {
                let _ = lease.remove_file(&tmp).await;
            }
            return Err(err);
        }
        tracing::debug!(path = %label, bytes, "uploaded");
        Ok(true)
    }

    async fn pull_file(
        &self,
        session: &RemoteSession,
        src: &str,
        dst: &Path,
        entry: &WalkEntry,
        policy: ConflictPolicy,
        run: &Run<'_>,
    ) -> AppResult<bool> {
        let label = run.label(&entry.rel);
        let existing = local_stat(dst).await?;
        if existing.is_some_and(|meta| meta.is_dir) {
            return Err(type_conflict(&label, true));
        }
        match decide(policy, &entry.meta, existing.as_ref()) {
            Decision::Skip => {
                tracing::debug!(path = %label, "skipped");
                return Ok(false);
            }
            Decision::Diverged => return Err(diverged(&label)),
            Decision::Transfer => {}
        }

        let parent = dst.parent().unwrap_or_else(|| Path::new("."));
        let tmp = parent.join(partial_name(&file_name_of(dst)));
        let mut lease = self.sessions.lease(session).await?;
        let mut reader = lease.open_read(src).await?;
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| local_error(e, &tmp))?;
        let pumped = pump(&mut reader, &mut file).await;
        drop(reader);
        let bytes = match pumped {
            Ok(bytes) => bytes,
            Err(failure) => {
                drop(file);
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(match failure {
                    PumpError::Read(err) => {
                        lease.mark_failed("remote read stream failed").await;
                        remote_stream_error(err, src)
                    }
                    PumpError::Write(err) => local_error(err, &tmp),
                });
            }
        };
        drop(lease);

        let mtime = UNIX_EPOCH + Duration::from_secs(entry.meta.mtime.max(0) as u64);
        let std_file = file.into_std().await;
        let stamped = tokio::task::spawn_blocking(move || {
            std_file.set_modified(mtime)?;
            std_file.sync_all()
        })
        .await
        .map_err(|e| AppError::of(AppErrorKind::Internal, e.to_string()))?;
        let placed = match stamped {
            Ok(()) => tokio::fs::rename(&tmp, dst).await,
            Err(err) => Err(err),
        };
        if let Err(err) = placed {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(local_error(err, dst));
        }
        tracing::debug!(path = %label, bytes, "downloaded");
        Ok(true)
    }
}

fn only(entry: WalkEntry, kind: DivergenceKind) -> DivergentEntry {
    let (local, remote) = match kind {
        DivergenceKind::LocalOnly => (Some(entry.meta), None),
        _ => (None, Some(entry.meta)),
    };
    DivergentEntry {
        path: entry.rel,
        kind,
        local,
        remote,
    }
}

async fn ensure_local_dir(path: &Path, run: &mut Run<'_>, with_parents: bool) -> AppResult<()> {
    match local_stat(path).await? {
        Some(meta) if meta.is_dir => return Ok(()),
        Some(_) => {
            return Err(type_conflict(&run.label(""), false)
                .with_context(path.display().to_string()));
        }
        None => {}
    }
    let created = if with_parents {
        tokio::fs::create_dir_all(path).await
    } else {
        tokio::fs::create_dir(path).await
    };
    created.map_err(|e| local_error(e, path))?;
    run.directories_created += 1;
    tracing::debug!(dir = %path.display(), "created local directory");
    Ok(())
}
