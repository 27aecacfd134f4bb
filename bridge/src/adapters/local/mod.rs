// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Transport that runs commands and file operations on this machine.
//!
//! Used when the "cluster" is the local host (workstations with a scheduler installed) and
//! for local-to-local sync. Paths starting with `~` expand against the local home.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::transport::{RemoteReader, RemoteWriter};
use crate::app::ports::{RemoteTransport, TransportConnector};
use crate::app::types::{EntryMeta, ExecCapture, RemoteDirEntry, Secret, SshConfig};

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

fn io_error(err: std::io::Error, op: &str, path: &Path) -> AppError {
    let kind = if err.kind() == std::io::ErrorKind::NotFound {
        AppErrorKind::NotFound
    } else {
        AppErrorKind::Internal
    };
    AppError::with_message(
        kind,
        codes::LOCAL_ERROR,
        format!("{op} {} failed: {err}", path.display()),
    )
}

fn entry_meta(meta: &std::fs::Metadata) -> EntryMeta {
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

#[derive(Debug, Default)]
pub struct LocalTransport {
    closed: bool,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed {
            return Err(AppError::of(
                AppErrorKind::TransportError,
                "local transport is closed",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTransport for LocalTransport {
    #[tracing::instrument(name = "local", level = "debug", skip(self, command), fields(op = "exec"))]
    async fn exec(&mut self, command: &str) -> AppResult<ExecCapture> {
        self.ensure_open()?;
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                AppError::with_message(
                    AppErrorKind::TransportError,
                    codes::LOCAL_ERROR,
                    format!("failed to spawn local shell: {err}"),
                )
            })?;
        Ok(ExecCapture {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn probe(&mut self) -> AppResult<()> {
        self.ensure_open()
    }

    async fn stat(&mut self, path: &str) -> AppResult<Option<EntryMeta>> {
        self.ensure_open()?;
        let path = expand(path);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(entry_meta(&meta))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(err, "stat", &path)),
        }
    }

    #[tracing::instrument(name = "local", level = "debug", skip(self), fields(op = "list_dir"))]
    async fn list_dir(&mut self, path: &str) -> AppResult<Vec<RemoteDirEntry>> {
        self.ensure_open()?;
        let path = expand(path);
        let mut dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|err| io_error(err, "list", &path))?;
        let mut out = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| io_error(err, "list", &path))?
        {
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::debug!(error = %err, "skipping entry without metadata");
                    continue;
                }
            };
            if !meta.is_dir() && !meta.is_file() {
                continue;
            }
            out.push(RemoteDirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                meta: entry_meta(&meta),
            });
        }
        Ok(out)
    }

    async fn create_dir(&mut self, path: &str) -> AppResult<()> {
        self.ensure_open()?;
        let path = expand(path);
        tokio::fs::create_dir(&path)
            .await
            .map_err(|err| io_error(err, "mkdir", &path))
    }

    async fn open_read(&mut self, path: &str) -> AppResult<RemoteReader> {
        self.ensure_open()?;
        let path = expand(path);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| io_error(err, "open", &path))?;
        Ok(Box::new(file))
    }

    async fn open_write(&mut self, path: &str) -> AppResult<RemoteWriter> {
        self.ensure_open()?;
        let path = expand(path);
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|err| io_error(err, "create", &path))?;
        Ok(Box::new(file))
    }

    async fn rename(&mut self, from: &str, to: &str) -> AppResult<()> {
        self.ensure_open()?;
        let (from, to) = (expand(from), expand(to));
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|err| io_error(err, "rename", &from))
    }

    async fn remove_file(&mut self, path: &str) -> AppResult<()> {
        self.ensure_open()?;
        let path = expand(path);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| io_error(err, "remove", &path))
    }

    async fn set_mtime(&mut self, path: &str, mtime: i64) -> AppResult<()> {
        self.ensure_open()?;
        let path = expand(path);
        let when = UNIX_EPOCH + Duration::from_secs(mtime.max(0) as u64);
        let target = path.clone();
        let stamped = tokio::task::spawn_blocking(move || {
            std::fs::File::options()
                .write(true)
                .open(&target)?
                .set_modified(when)
        })
        .await
        .map_err(|err| AppError::of(AppErrorKind::Internal, err.to_string()))?;
        stamped.map_err(|err| io_error(err, "set mtime on", &path))
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Hands out [`LocalTransport`]s. Host keys and credentials do not apply.
#[derive(Debug, Clone, Default)]
pub struct LocalConnector;

impl LocalConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportConnector for LocalConnector {
    async fn connect(
        &self,
        config: &SshConfig,
        _secret: Option<Secret>,
    ) -> AppResult<Box<dyn RemoteTransport>> {
        tracing::debug!(target_host = %config.host, "opening local transport");
        Ok(Box::new(LocalTransport::new()))
    }

    async fn accept_host_key(&self, _config: &SshConfig) -> AppResult<String> {
        Ok("local transport has no host key".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn exec_captures_output_and_exit_code() {
        let mut transport = LocalTransport::new();
        let capture = transport
            .exec("echo out; echo err >&2; exit 3")
            .await
            .unwrap();
        assert_eq!(capture.stdout_text(), "out\n");
        assert_eq!(capture.stderr_text(), "err\n");
        assert_eq!(capture.exit_code, 3);
    }

    #[tokio::test]
    async fn file_operations_round_trip_through_the_filesystem() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("out");
        let dir_str = dir.to_string_lossy().into_owned();
        let mut transport = LocalTransport::new();

        assert_eq!(transport.stat(&dir_str).await.unwrap(), None);
        transport.create_dir(&dir_str).await.unwrap();

        let tmp_file = format!("{dir_str}/.a.part");
        let final_file = format!("{dir_str}/a.txt");
        let mut writer = transport.open_write(&tmp_file).await.unwrap();
        writer.write_all(b"hello").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);
        transport.set_mtime(&tmp_file, 1_700_000_000).await.unwrap();
        transport.rename(&tmp_file, &final_file).await.unwrap();

        let listing = transport.list_dir(&dir_str).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "a.txt");
        assert_eq!(listing[0].meta.size, 5);
        assert_eq!(listing[0].meta.mtime, 1_700_000_000);

        let mut reader = transport.open_read(&final_file).await.unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn closed_transport_reports_transport_error() {
        let mut transport = LocalTransport::new();
        transport.close().await;
        assert!(transport.is_closed());
        let err = transport.exec("true").await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::TransportError);
    }
}
