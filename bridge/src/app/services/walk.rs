// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Lazy tree enumeration for sync.
//!
//! Both walkers yield entries in pre-order with siblings sorted by name, so comparing
//! `/`-separated relative paths component by component orders the two streams identically.
//! Directories always come before their contents.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use globset::{GlobBuilder, GlobMatcher};
use walkdir::WalkDir;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::services::sessions::{RemoteSession, SessionManager};
use crate::app::services::shell::join_remote;
use crate::app::types::{EntryMeta, SyncFilterAction, SyncFilterRule};

/// Marker in the names of in-flight temporary files.
pub(crate) const PARTIAL_MARKER: &str = ".dayhoff-";
pub(crate) const PARTIAL_SUFFIX: &str = ".part";

pub(crate) fn is_partial_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(PARTIAL_MARKER) && name.ends_with(PARTIAL_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Path relative to the walk root, `/`-separated.
    pub rel: String,
    pub meta: EntryMeta,
}

/// Orders relative paths the way both walkers emit them.
pub fn compare_rel(a: &str, b: &str) -> Ordering {
    a.split('/').cmp(b.split('/'))
}

pub(crate) fn local_meta(meta: &std::fs::Metadata) -> EntryMeta {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    EntryMeta {
        size: if meta.is_dir() { 0 } else { meta.len() },
        mtime,
        is_dir: meta.is_dir(),
    }
}

pub(crate) fn local_error(err: std::io::Error, path: &Path) -> AppError {
    let kind = if err.kind() == std::io::ErrorKind::NotFound {
        AppErrorKind::NotFound
    } else {
        AppErrorKind::Internal
    };
    AppError::with_message(kind, codes::LOCAL_ERROR, err.to_string())
        .with_context(path.display().to_string())
}

/// One compiled filter rule, including pattern metadata needed for matching.
#[derive(Debug)]
struct CompiledFilterRule {
    action: SyncFilterAction,
    matcher: GlobMatcher,
    only_dir: bool,
    match_basename: bool,
}

/// An ordered set of include/exclude rules; the first matching rule decides.
#[derive(Debug, Default)]
pub struct PathFilter {
    rules: Vec<CompiledFilterRule>,
}

impl PathFilter {
    pub fn new(rules: &[SyncFilterRule]) -> AppResult<Self> {
        let compiled = rules
            .iter()
            .map(CompiledFilterRule::compile)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { rules: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn should_include(&self, rel: &str, is_dir: bool) -> bool {
        let basename = rel.rsplit('/').next().unwrap_or(rel);
        for rule in &self.rules {
            if rule.matches(rel, basename, is_dir) {
                return matches!(rule.action, SyncFilterAction::Include);
            }
        }
        true
    }
}

impl CompiledFilterRule {
    fn compile(rule: &SyncFilterRule) -> AppResult<Self> {
        let invalid = |why: &str| {
            AppError::of(
                AppErrorKind::InvalidArgument,
                format!("invalid filter pattern '{}': {why}", rule.pattern),
            )
        };
        let mut pattern = rule.pattern.trim().to_string();
        let only_dir = pattern.ends_with('/');
        while pattern.ends_with('/') {
            pattern.pop();
        }
        let anchored = pattern.starts_with('/');
        if anchored {
            pattern = pattern.trim_start_matches('/').to_string();
        }
        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let has_slash = pattern.contains('/');
        let match_basename = !has_slash && !anchored;
        if has_slash && !anchored && !pattern.starts_with("**/") {
            pattern = format!("**/{pattern}");
        }

        let matcher = GlobBuilder::new(&pattern)
            .literal_separator(true)
            .build()
            .map_err(|err| invalid(&err.to_string()))?
            .compile_matcher();
        Ok(Self {
            action: rule.action,
            matcher,
            only_dir,
            match_basename,
        })
    }

    fn matches(&self, rel: &str, basename: &str, is_dir: bool) -> bool {
        if self.only_dir && !is_dir {
            return false;
        }
        if self.match_basename {
            self.matcher.is_match(basename)
        } else {
            self.matcher.is_match(rel)
        }
    }
}

fn rel_path_to_slash(path: &Path) -> String {
    let mut out = String::new();
    for comp in path.components() {
        if let std::path::Component::Normal(os) = comp {
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&os.to_string_lossy());
        }
    }
    out
}

type DirEntries = Box<dyn Iterator<Item = walkdir::Result<walkdir::DirEntry>> + Send>;

/// Lazy walk of a local directory. Excluded directories are pruned, not descended.
pub struct LocalWalker {
    root: PathBuf,
    filter: Arc<PathFilter>,
    entries: DirEntries,
}

impl LocalWalker {
    pub fn new(root: &Path, filter: Arc<PathFilter>) -> Self {
        let prune_root = root.to_path_buf();
        let prune_filter = filter.clone();
        let entries = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                match entry.path().strip_prefix(&prune_root) {
                    Ok(rel) => prune_filter.should_include(&rel_path_to_slash(rel), true),
                    Err(_) => true,
                }
            });
        Self {
            root: root.to_path_buf(),
            filter,
            entries: Box::new(entries),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Iterator for LocalWalker {
    type Item = WalkEntry;

    fn next(&mut self) -> Option<WalkEntry> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable local entry");
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            let file_type = entry.file_type();
            if !file_type.is_dir() && !file_type.is_file() {
                tracing::debug!(path = %entry.path().display(), "skipping special file");
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let rel = rel_path_to_slash(rel);
            let name = rel.rsplit('/').next().unwrap_or(&rel);
            if is_partial_name(name) {
                continue;
            }
            if file_type.is_file() && !self.filter.should_include(&rel, false) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => local_meta(&meta),
                Err(err) => {
                    tracing::warn!(error = %err, path = %rel, "skipping local entry without metadata");
                    continue;
                }
            };
            return Some(WalkEntry { rel, meta });
        }
    }
}

/// Lazy walk of a remote directory: one listing per directory, held only while its entries
/// are being emitted.
pub struct RemoteWalker<'a> {
    sessions: &'a SessionManager,
    session: &'a RemoteSession,
    root: String,
    filter: Arc<PathFilter>,
    levels: Vec<VecDeque<WalkEntry>>,
    started: bool,
}

impl<'a> RemoteWalker<'a> {
    pub fn new(
        sessions: &'a SessionManager,
        session: &'a RemoteSession,
        root: impl Into<String>,
        filter: Arc<PathFilter>,
    ) -> Self {
        Self {
            sessions,
            session,
            root: root.into(),
            filter,
            levels: Vec::new(),
            started: false,
        }
    }

    async fn list(&self, rel: &str) -> AppResult<VecDeque<WalkEntry>> {
        let dir = join_remote(&self.root, rel);
        let mut lease = self.sessions.lease(self.session).await?;
        let mut listing = lease.list_dir(&dir).await?;
        drop(lease);
        listing.sort_by(|a, b| a.name.cmp(&b.name));

        let mut entries = VecDeque::with_capacity(listing.len());
        for item in listing {
            if item.name == "." || item.name == ".." || is_partial_name(&item.name) {
                continue;
            }
            let child = if rel.is_empty() {
                item.name.clone()
            } else {
                format!("{rel}/{}", item.name)
            };
            if self.filter.should_include(&child, item.meta.is_dir) {
                entries.push_back(WalkEntry {
                    rel: child,
                    meta: item.meta,
                });
            }
        }
        Ok(entries)
    }

    pub async fn next(&mut self) -> AppResult<Option<WalkEntry>> {
        if !self.started {
            self.started = true;
            let top = self.list("").await?;
            self.levels.push(top);
        }
        loop {
            let Some(level) = self.levels.last_mut() else {
                return Ok(None);
            };
            let Some(entry) = level.pop_front() else {
                self.levels.pop();
                continue;
            };
            if entry.meta.is_dir {
                let children = self.list(&entry.rel).await?;
                self.levels.push(children);
            }
            return Ok(Some(entry));
        }
    }
}
