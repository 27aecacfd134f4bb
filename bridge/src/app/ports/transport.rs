// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::app::errors::AppResult;
use crate::app::types::{EntryMeta, ExecCapture, RemoteDirEntry, Secret, SshConfig};

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
/// One authenticated connection to one host, used for command execution and file transfer.
/// Owned exclusively by the session manager, which serializes access to it.
///
/// Failures of the connection itself must surface as `TransportError`; anything else
/// (missing file, permission denied) uses the matching non-transient kind.
pub trait RemoteTransport: Send + Sync {
    async fn exec(&mut self, command: &str) -> AppResult<ExecCapture>;

    /// Cheap round-trip used to tell a slow command from a dead connection.
    async fn probe(&mut self) -> AppResult<()>;

    async fn stat(&mut self, path: &str) -> AppResult<Option<EntryMeta>>;
    async fn list_dir(&mut self, path: &str) -> AppResult<Vec<RemoteDirEntry>>;
    async fn create_dir(&mut self, path: &str) -> AppResult<()>;
    async fn open_read(&mut self, path: &str) -> AppResult<RemoteReader>;
    /// Creates or truncates `path`.
    async fn open_write(&mut self, path: &str) -> AppResult<RemoteWriter>;
    /// Renames over an existing destination.
    async fn rename(&mut self, from: &str, to: &str) -> AppResult<()>;
    async fn remove_file(&mut self, path: &str) -> AppResult<()>;
    async fn set_mtime(&mut self, path: &str, mtime: i64) -> AppResult<()>;

    fn is_closed(&self) -> bool;
    async fn close(&mut self);
}

#[async_trait]
/// Opens transports. Host-key verification and authentication happen here; a rejected
/// host key must fail before any transport exists.
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        config: &SshConfig,
        secret: Option<Secret>,
    ) -> AppResult<Box<dyn RemoteTransport>>;

    /// Records the key the host currently presents as trusted. Operator action only.
    async fn accept_host_key(&self, config: &SshConfig) -> AppResult<String>;
}
